use crate::model::FileType;

/// What an adapter saw while chewing through a file. Malformed records are
/// skipped and recorded here; they never abort a parse.
#[derive(Clone, Debug, Default)]
pub struct ParseReport {
    pub record_count: u64,
    pub parse_errors: Vec<String>,
}

impl ParseReport {
    pub fn record(&mut self) {
        self.record_count += 1;
    }

    pub fn error(&mut self, line_number: usize, what: impl Into<String>) {
        self.record_count += 1;
        self.parse_errors
            .push(format!("line {}: {}", line_number, what.into()));
    }

    pub fn parsed_ok(&self) -> u64 {
        self.record_count - self.parse_errors.len() as u64
    }
}

/// A format adapter is a pure function from input bytes to records plus a
/// report. Stateful cursors (the schedule adapter tracks the record pair
/// that makes up one train) live inside the call, not across calls.
pub trait FormatAdapter {
    type Record;

    fn parse(&self, data: &[u8]) -> (Vec<Self::Record>, ParseReport);
}

/// Work out what kind of file we were handed, by suffix first and by first
/// record when the suffix says nothing.
pub fn detect_file_type(name: &str, data: &[u8]) -> Option<FileType> {
    let lower = name.to_lowercase();
    if lower.ends_with(".cif") || lower.ends_with(".ztr") || lower.ends_with(".mca") {
        return Some(FileType::Schedule);
    }
    if lower.ends_with(".msn") {
        return Some(FileType::Station);
    }
    if lower.ends_with(".alf") {
        return Some(FileType::Connection);
    }

    let first_line = data
        .split(|byte| *byte == b'\n')
        .next()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    if first_line.starts_with("HD") || first_line.starts_with("BS") {
        Some(FileType::Schedule)
    } else if first_line.starts_with("A ") || first_line.starts_with("A    ") {
        Some(FileType::Station)
    } else if first_line.starts_with("M=") || first_line.starts_with("M ") {
        Some(FileType::Connection)
    } else {
        None
    }
}
