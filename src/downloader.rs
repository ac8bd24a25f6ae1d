use crate::attendance::AttendanceEntry;
use std::error::Error;

const HEADERS: [&str; 3] = ["Student", "Date", "Status"];

/// Convert the attendance listing to CSV format
///
/// Produces a header row followed by one line per record. Values
/// containing commas, quotes or newlines are quoted, with inner quotes
/// doubled.
///
/// # Arguments
/// * `entries` - The attendance rows to export, already filtered
///
/// # Returns
/// * `String` - CSV content
pub fn to_csv(entries: &[AttendanceEntry]) -> String {
    let mut csv_content = HEADERS.join(",");
    csv_content.push('\n');

    for entry in entries {
        let fields = [&entry.student_name, &entry.date, &entry.status];
        let line: Vec<String> = fields.iter().map(|value| escape(value)).collect();
        csv_content.push_str(&line.join(","));
        csv_content.push('\n');
    }

    csv_content
}

fn escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Convert the attendance listing to XLSX format
///
/// Writes a bold header row and one row per record using rust_xlsxwriter,
/// so the file opens directly in Excel or LibreOffice.
///
/// # Arguments
/// * `entries` - The attendance rows to export, already filtered
///
/// # Returns
/// * `Result<Vec<u8>, Box<dyn Error + Send + Sync>>` - XLSX file content as bytes or an error
pub fn to_xlsx(entries: &[AttendanceEntry]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    use rust_xlsxwriter::{Format, Workbook};

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Attendance")?;

    let bold = Format::new().set_bold();
    for (col, title) in HEADERS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *title, &bold)?;
    }

    for (index, entry) in entries.iter().enumerate() {
        let row = index as u32 + 1;
        worksheet.write_string(row, 0, &entry.student_name)?;
        worksheet.write_string(row, 1, &entry.date)?;
        worksheet.write_string(row, 2, &entry.status)?;
    }
    worksheet.set_column_width(0, 28)?;
    worksheet.set_column_width(1, 12)?;

    Ok(workbook.save_to_buffer()?)
}
