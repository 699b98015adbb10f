//! SQM data file parser.
//!
//! Data files are delimited text with a header row naming an `msas` column.
//! Opening a file reads only as far as the first valid reading; the rest is
//! consumed on demand by [`DataFile::readings_from`] or [`DataFile::into_rows`],
//! and [`DataFile::last_reading`] reads backward from the end without touching
//! the forward position.
//!
//! Supported layouts include the standard darksky format
//! (`# UTC Date & Time, Local Date & Time, ..., MSAS` with `;`-separated rows)
//! and plain CSV exports with separate local date and time columns.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use time::UtcOffset;

use sqm_types::{RawReadings, StationInfo, parse_datetime};

use crate::error::{Error, Result};

/// Separators tried in order; the first that splits a line wins.
const DELIMITERS: [&str; 5] = [", ", ",", ";", "\t", "|"];

/// Bytes read per step when scanning backward for the last reading.
const BACKWARD_BLOCK: u64 = 4096;

const NO_NAME: &str = "No name specified";

/// One data row with its fields keyed by header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub datetime: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatetimeColumns {
    Combined(usize),
    Split { date: usize, time: usize },
}

/// Where the datetime and value live in a data row.
#[derive(Debug, Clone)]
struct Layout {
    delimiter: &'static str,
    datetime: DatetimeColumns,
    value: usize,
    max_index: usize,
}

impl Layout {
    fn reading(&self, fields: &[String]) -> Option<(String, String)> {
        if fields.len() <= self.max_index {
            return None;
        }
        let datetime = match self.datetime {
            DatetimeColumns::Combined(i) => fields[i].clone(),
            DatetimeColumns::Split { date, time } => format!("{} {}", fields[date], fields[time]),
        };
        if datetime.trim().is_empty() {
            return None;
        }
        Some((datetime, fields[self.value].clone()))
    }

    fn reading_from_line(&self, line: &[u8]) -> Option<(String, String)> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() || text.starts_with('#') {
            return None;
        }
        self.reading(&split_fields(text, self.delimiter))
    }
}

/// An open data file positioned after its first valid reading.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    reader: BufReader<File>,
    layout: Layout,
    comments: Vec<String>,
    /// Header names as written, with any leading `#` removed.
    header: Vec<String>,
    first_row: Vec<String>,
    first_reading: (String, String),
}

impl DataFile {
    /// Open and validate a data file.
    ///
    /// Fails with [`Error::InvalidDataFile`] if no `msas` header, no datetime
    /// columns, or no valid reading can be found.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let mut reader = BufReader::new(file);
        let mut comments = Vec::new();

        let (header, columns) = loop {
            let line = read_line(&mut reader)
                .map_err(|e| Error::io(&path, e))?
                .ok_or_else(|| Error::invalid(&path, "could not find an msas column"))?;
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with('#') {
                comments.push(line.clone());
            }
            if !line.to_lowercase().contains("msas") {
                continue;
            }
            let Some(delimiter) = detect_delimiter(&line) else {
                continue;
            };
            let header = split_fields(&line, delimiter);
            let columns = classify_columns(&header);
            if columns.value.is_some() {
                break (header, columns);
            }
        };

        let value = columns.value.unwrap_or_default();
        let datetime = match (columns.datetime, columns.date, columns.time) {
            (Some(i), _, _) => DatetimeColumns::Combined(i),
            (None, Some(date), Some(time)) => DatetimeColumns::Split { date, time },
            _ => return Err(Error::invalid(&path, "could not find local datetime columns")),
        };
        let max_index = match datetime {
            DatetimeColumns::Combined(i) => i.max(value),
            DatetimeColumns::Split { date, time } => date.max(time).max(value),
        };

        let mut line = loop {
            let line = read_line(&mut reader)
                .map_err(|e| Error::io(&path, e))?
                .ok_or_else(|| Error::invalid(&path, "no data rows"))?;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            if detect_delimiter(&line).is_some() {
                break line;
            }
        };
        let delimiter = detect_delimiter(&line).unwrap_or(DELIMITERS[0]);
        let layout = Layout {
            delimiter,
            datetime,
            value,
            max_index,
        };

        let (first_row, first_reading) = loop {
            let fields = split_fields(&line, layout.delimiter);
            if let Some(reading) = layout.reading(&fields) {
                break (fields, reading);
            }
            line = read_line(&mut reader)
                .map_err(|e| Error::io(&path, e))?
                .ok_or_else(|| Error::invalid(&path, "no valid reading"))?;
        };

        let header = header
            .into_iter()
            .map(|h| h.trim_start_matches('#').trim().to_string())
            .collect();

        Ok(Self {
            path,
            reader,
            layout,
            comments,
            header,
            first_row,
            first_reading,
        })
    }

    /// Returns true if `path` opens as a data file with at least one reading.
    pub fn is_valid<P: AsRef<Path>>(path: P) -> bool {
        Self::open(path).is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header and comment lines starting with `#`.
    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    /// Column names from the header row.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// The first valid reading in the file as `(datetime, value)` strings.
    pub fn first_reading(&self) -> (String, String) {
        self.first_reading.clone()
    }

    /// Every reading from the first onward.
    ///
    /// Consumes the remainder of the file; when a datetime repeats, the later
    /// row wins.
    pub fn readings_from(&mut self) -> Result<RawReadings> {
        let mut readings = RawReadings::new();
        let (datetime, value) = self.first_reading.clone();
        readings.insert(datetime, value);
        while let Some(line) = read_line(&mut self.reader).map_err(|e| Error::io(&self.path, e))? {
            if let Some((datetime, value)) = self.layout.reading_from_line(line.as_bytes()) {
                readings.insert(datetime, value);
            }
        }
        Ok(readings)
    }

    /// Every data row from the first onward, fields keyed by header name.
    pub fn into_rows(mut self) -> Result<Vec<RawRow>> {
        let mut rows = vec![self.row(&self.first_row, self.first_reading.0.clone())];
        while let Some(line) = read_line(&mut self.reader).map_err(|e| Error::io(&self.path, e))? {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let fields = split_fields(&line, self.layout.delimiter);
            if let Some((datetime, _)) = self.layout.reading(&fields) {
                rows.push(self.row(&fields, datetime));
            }
        }
        Ok(rows)
    }

    fn row(&self, fields: &[String], datetime: String) -> RawRow {
        RawRow {
            datetime,
            fields: self
                .header
                .iter()
                .zip(fields)
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    /// The last valid reading, found by reading backward from the end.
    ///
    /// The forward read position is restored afterward. Trailing bytes without
    /// a final line terminator count as the last line.
    pub fn last_reading(&mut self) -> Result<Option<(String, String)>> {
        let position = self
            .reader
            .stream_position()
            .map_err(|e| Error::io(&self.path, e))?;
        let result = self.scan_backward();
        self.reader
            .seek(SeekFrom::Start(position))
            .map_err(|e| Error::io(&self.path, e))?;
        result.map_err(|e| Error::io(&self.path, e))
    }

    fn scan_backward(&mut self) -> std::io::Result<Option<(String, String)>> {
        let file = self.reader.get_mut();
        let mut end = file.seek(SeekFrom::End(0))?;
        let mut pending: Vec<u8> = Vec::new();

        loop {
            if end == 0 {
                return Ok(self.layout.reading_from_line(&pending));
            }
            let start = end.saturating_sub(BACKWARD_BLOCK);
            let mut block = vec![0u8; (end - start) as usize];
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut block)?;
            end = start;

            block.extend_from_slice(&pending);
            pending = block;

            while let Some(pos) = pending.iter().rposition(|b| *b == b'\n' || *b == b'\r') {
                let line = pending.split_off(pos + 1);
                pending.truncate(pos);
                if let Some(reading) = self.layout.reading_from_line(&line) {
                    return Ok(Some(reading));
                }
            }
        }
    }

    /// Station details from comment lines, falling back to header columns.
    ///
    /// Returns `None` when no latitude can be found.
    pub fn station_info(&self) -> Option<StationInfo> {
        let mut supplier = None;
        let mut location = None;
        let mut name = None;
        let mut latitude = None;
        let mut longitude = None;
        let mut elevation = None;

        for line in &self.comments {
            if line.starts_with("# Data supplier") {
                supplier = Some(after_colon(line).trim().to_string());
            } else if line.starts_with("# Location name: ") {
                location = Some(after_colon(line).trim().to_string());
            } else if line.starts_with("# Name: ") || line.starts_with("# SQM Name: ") {
                name = Some(after_colon(line).trim().to_string());
            } else if line.starts_with("# Position") {
                let parts: Vec<&str> = after_colon(line).split(", ").collect();
                if parts.len() >= 2 {
                    latitude = leading_float(parts[0]);
                    longitude = leading_float(parts[1]);
                }
                if parts.len() >= 3 {
                    elevation = leading_float(parts[2]);
                }
            }
        }

        let mut name = name.unwrap_or_else(|| match (supplier, location) {
            (Some(s), Some(l)) => format!("{s} {l}"),
            (Some(s), None) => s,
            (None, Some(l)) => l,
            (None, None) => NO_NAME.to_string(),
        });

        if latitude.is_none() {
            for (i, column) in self.header.iter().enumerate() {
                let column = column.to_lowercase();
                let Some(field) = self.first_row.get(i) else {
                    continue;
                };
                if column.contains("location") {
                    name = field.clone();
                } else if column.contains("lat") && !column.contains("galactic") {
                    latitude = leading_float(field);
                } else if column.contains("long") && !column.contains("galactic") {
                    longitude = leading_float(field);
                }
            }
        }

        latitude.map(|latitude| StationInfo {
            name,
            latitude: Some(latitude),
            longitude,
            elevation,
            utc_offset: self.utc_offset_hint(),
        })
    }

    /// Offset between the local and UTC timestamps of the first row.
    ///
    /// Only available when the file carries UTC datetime columns; rounded to the
    /// nearest quarter hour.
    pub fn utc_offset_hint(&self) -> Option<UtcOffset> {
        let lower: Vec<String> = self.header.iter().map(|h| h.to_lowercase()).collect();
        let combined = find_column(&lower, |h| {
            h.contains("utc") && h.contains("date") && h.contains("time")
        });
        let utc = match combined {
            Some(i) => self.first_row.get(i)?.clone(),
            None => {
                let date = find_column(&lower, |h| h.contains("utc") && h.contains("date"))?;
                let time = find_column(&lower, |h| h.contains("utc") && h.contains("time"))?;
                format!("{} {}", self.first_row.get(date)?, self.first_row.get(time)?)
            }
        };
        let utc = parse_datetime(&utc).ok()?;
        let local = parse_datetime(&self.first_reading.0).ok()?;
        let seconds = (local - utc).whole_seconds();
        let rounded = ((seconds as f64 / 900.0).round() as i64) * 900;
        UtcOffset::from_whole_seconds(i32::try_from(rounded).ok()?).ok()
    }
}

#[derive(Debug, Default)]
struct Columns {
    datetime: Option<usize>,
    date: Option<usize>,
    time: Option<usize>,
    value: Option<usize>,
}

fn classify_columns(header: &[String]) -> Columns {
    let mut columns = Columns::default();
    for (i, name) in header.iter().enumerate() {
        let name = name.to_lowercase();
        if name.contains("local") {
            match (name.contains("date"), name.contains("time")) {
                (true, true) => columns.datetime = Some(i),
                (true, false) => columns.date = Some(i),
                (false, true) => columns.time = Some(i),
                (false, false) => {}
            }
        }
        if name.contains("msas") && !name.contains("msas_avg") {
            columns.value = Some(i);
        }
    }
    columns
}

fn find_column(header: &[String], pred: impl Fn(&str) -> bool) -> Option<usize> {
    header.iter().position(|h| pred(h))
}

/// Read one line, replacing invalid UTF-8 and stripping the terminator.
fn read_line<R: BufRead>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn detect_delimiter(line: &str) -> Option<&'static str> {
    DELIMITERS.into_iter().find(|d| line.contains(d))
}

/// Split on `delimiter` outside double quotes and trim each field.
///
/// Delimiters may be several bytes long (`", "`), which rules out the `csv`
/// crate's single-byte reader.
fn split_fields(line: &str, delimiter: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut rest = line;
    while let Some(c) = rest.chars().next() {
        if c == '"' {
            if in_quotes && rest[1..].starts_with('"') {
                current.push('"');
                rest = &rest[2..];
                continue;
            }
            in_quotes = !in_quotes;
            rest = &rest[1..];
            continue;
        }
        if !in_quotes && rest.starts_with(delimiter) {
            fields.push(current.trim().to_string());
            current.clear();
            rest = &rest[delimiter.len()..];
            continue;
        }
        current.push(c);
        rest = &rest[c.len_utf8()..];
    }
    fields.push(current.trim().to_string());
    fields
}

fn after_colon(line: &str) -> &str {
    match line.find(": ") {
        Some(pos) if pos > 0 => &line[pos + 2..],
        _ => match line.find(':') {
            Some(pos) if pos > 0 => &line[pos + 1..],
            _ => line,
        },
    }
}

/// Parse the numeric prefix of `s`, ignoring trailing units.
fn leading_float(s: &str) -> Option<f64> {
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].parse().ok()
}
