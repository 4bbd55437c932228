//! Daily attendance report as a PDF document.

use crate::attendance::AttendanceRecord;
use chrono::{Local, NaiveDate, NaiveDateTime};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use thiserror::Error;

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN_LEFT: f32 = 50.0;
const RULE_RIGHT: f32 = 550.0;
const BOTTOM_MARGIN: f32 = 80.0;
const ROW_HEIGHT: f32 = 20.0;
const HEADER_GAP: f32 = 30.0;
const COLUMNS: [(f32, &str); 3] = [(50.0, "Name"), (250.0, "Time"), (420.0, "Status")];

pub const REPORT_TITLE: &str = "Today's Attendance Report";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("pdf encoding failed: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("pdf write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns one day's records into a document.
pub trait ReportRenderer: Send + Sync {
    fn render(&self, day: NaiveDate, records: &[AttendanceRecord]) -> Result<Vec<u8>, ReportError>;
}

/// A4 table layout: title, generation time, then Name / Time / Status rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfReportRenderer;

impl ReportRenderer for PdfReportRenderer {
    fn render(&self, day: NaiveDate, records: &[AttendanceRecord]) -> Result<Vec<u8>, ReportError> {
        self.render_at(day, Local::now().naive_local(), records)
    }
}

impl PdfReportRenderer {
    pub fn render_at(
        &self,
        day: NaiveDate,
        generated_at: NaiveDateTime,
        records: &[AttendanceRecord],
    ) -> Result<Vec<u8>, ReportError> {
        let pages = layout(generated_at, records);

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let regular = doc.add_object(font("Helvetica"));
        let bold = doc.add_object(font("Helvetica-Bold"));
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => regular,
                "F2" => bold,
            },
        });

        let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
        for operations in pages {
            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
            let page_id: ObjectId = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out)?;
        tracing::info!(%day, records = records.len(), pages = count, bytes = out.len(), "report rendered");
        Ok(out)
    }
}

fn font(base: &str) -> lopdf::Dictionary {
    dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => base,
        "Encoding" => "WinAnsiEncoding",
    }
}

/// Content operations per page.
fn layout(generated_at: NaiveDateTime, records: &[AttendanceRecord]) -> Vec<Vec<Operation>> {
    let mut pages = Vec::new();
    let mut ops = Vec::new();

    text(&mut ops, "F2", 18.0, 170.0, PAGE_HEIGHT - 50.0, REPORT_TITLE);
    text(
        &mut ops,
        "F1",
        11.0,
        MARGIN_LEFT,
        PAGE_HEIGHT - 80.0,
        &format!("Generated on: {}", generated_at.format("%d-%m-%Y %I:%M %p")),
    );
    let mut y = header(&mut ops, PAGE_HEIGHT - 120.0);

    for record in records {
        if y < BOTTOM_MARGIN {
            pages.push(std::mem::take(&mut ops));
            y = header(&mut ops, PAGE_HEIGHT - 80.0);
        }
        let time = record.time.format("%H:%M:%S").to_string();
        let cells = [record.name.as_str(), time.as_str(), record.status.as_str()];
        for ((x, _), cell) in COLUMNS.iter().zip(cells) {
            text(&mut ops, "F1", 11.0, *x, y, cell);
        }
        y -= ROW_HEIGHT;
    }

    pages.push(ops);
    pages
}

/// Column headers with an underline; returns the y of the first row.
fn header(ops: &mut Vec<Operation>, y: f32) -> f32 {
    for (x, label) in COLUMNS {
        text(ops, "F2", 12.0, x, y, label);
    }
    ops.push(Operation::new("w", vec![0.5_f32.into()]));
    ops.push(Operation::new("m", vec![MARGIN_LEFT.into(), (y - 5.0).into()]));
    ops.push(Operation::new("l", vec![RULE_RIGHT.into(), (y - 5.0).into()]));
    ops.push(Operation::new("S", vec![]));
    y - HEADER_GAP
}

fn text(ops: &mut Vec<Operation>, font: &str, size: f32, x: f32, y: f32, s: &str) {
    ops.push(Operation::new("BT", vec![]));
    ops.push(Operation::new("Tf", vec![font.into(), size.into()]));
    ops.push(Operation::new("Td", vec![x.into(), y.into()]));
    ops.push(Operation::new("Tj", vec![Object::string_literal(win_ansi(s))]));
    ops.push(Operation::new("ET", vec![]));
}

/// Latin-1 subset of WinAnsi; anything else becomes '?'.
fn win_ansi(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}
