use crate::error::{IndexError, Result, Stage};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Field layout of a delimited corpus.
///
/// Defaults match IMDb's `title.basics.tsv`: `tconst` in field 0,
/// `primaryTitle` in field 2, and at least four fields per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusSchema {
    pub delimiter: char,
    pub id_field: usize,
    pub text_field: usize,
    pub min_fields: usize,
    pub has_header: bool,
}

impl Default for CorpusSchema {
    fn default() -> Self {
        Self { delimiter: '\t', id_field: 0, text_field: 2, min_fields: 4, has_header: true }
    }
}

impl CorpusSchema {
    pub fn validate(&self) -> Result<()> {
        let needed = self.id_field.max(self.text_field) + 1;
        if self.min_fields < needed {
            return Err(IndexError::config(format!(
                "min_fields is {} but field {} is indexed",
                self.min_fields,
                needed - 1
            )));
        }
        if self.id_field == self.text_field {
            return Err(IndexError::config("id_field and text_field must differ"));
        }
        Ok(())
    }

    /// Pick the document id and text out of a raw line.
    pub fn parse<'a>(&self, raw: &'a RawRecord) -> Result<Record<'a>> {
        let fields: Vec<&str> = raw.text.split(self.delimiter).collect();
        if fields.len() < self.min_fields {
            return Err(IndexError::Schema { line: raw.line, expected: self.min_fields, found: fields.len() });
        }
        // An unvalidated schema may point past `min_fields`.
        match (fields.get(self.id_field), fields.get(self.text_field)) {
            (Some(&id), Some(&text)) => Ok(Record { id, text }),
            _ => Err(IndexError::Schema {
                line: raw.line,
                expected: self.id_field.max(self.text_field) + 1,
                found: fields.len(),
            }),
        }
    }
}

/// One unparsed corpus line with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub line: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub id: &'a str,
    pub text: &'a str,
}

/// Sequential line reader over a corpus. The header line, if any, is skipped.
pub struct CorpusReader<R> {
    lines: io::Lines<R>,
    path: PathBuf,
    line: u64,
    skip_header: bool,
}

impl CorpusReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P, schema: &CorpusSchema) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| IndexError::io(Stage::Read, path, e))?;
        Ok(Self::new(BufReader::new(f), path, schema.has_header))
    }
}

impl<R: BufRead> CorpusReader<R> {
    /// `path` only labels errors.
    pub fn new<P: AsRef<Path>>(reader: R, path: P, has_header: bool) -> Self {
        Self { lines: reader.lines(), path: path.as_ref().to_path_buf(), line: 0, skip_header: has_header }
    }
}

impl<R: BufRead> Iterator for CorpusReader<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next = self.lines.next()?;
            self.line += 1;
            let mut text = match next {
                Ok(text) => text,
                Err(e) => return Some(Err(IndexError::io(Stage::Read, &self.path, e))),
            };
            if self.skip_header {
                self.skip_header = false;
                continue;
            }
            if text.ends_with('\r') {
                text.pop();
            }
            return Some(Ok(RawRecord { line: self.line, text }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TSV: &str = "tconst\ttitleType\tprimaryTitle\toriginalTitle\n\
                       tt01\tmovie\tThe Matrix\tThe Matrix\r\n\
                       tt02\tmovie\n\
                       tt03\tshort\tThe Room\tThe Room\n";

    #[test]
    fn skips_header_and_numbers_lines() {
        let records: Vec<RawRecord> =
            CorpusReader::new(Cursor::new(TSV), "mem", true).collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].line, 2);
        assert_eq!(records[0].text, "tt01\tmovie\tThe Matrix\tThe Matrix");
        assert_eq!(records[2].line, 4);
    }

    #[test]
    fn keeps_first_line_without_header() {
        let records: Vec<RawRecord> =
            CorpusReader::new(Cursor::new("a\tb\n"), "mem", false).collect::<Result<_>>().unwrap();
        assert_eq!(records, vec![RawRecord { line: 1, text: "a\tb".into() }]);
    }

    #[test]
    fn parse_rejects_short_rows() {
        let schema = CorpusSchema::default();
        let records: Vec<RawRecord> =
            CorpusReader::new(Cursor::new(TSV), "mem", true).collect::<Result<_>>().unwrap();

        let ok = schema.parse(&records[0]).unwrap();
        assert_eq!(ok, Record { id: "tt01", text: "The Matrix" });

        match schema.parse(&records[1]) {
            Err(IndexError::Schema { line, expected, found }) => {
                assert_eq!((line, expected, found), (3, 4, 2));
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn validate_checks_field_positions() {
        assert!(CorpusSchema::default().validate().is_ok());
        let bad = CorpusSchema { text_field: 5, ..CorpusSchema::default() };
        assert!(matches!(bad.validate(), Err(IndexError::Config(_))));
        let same = CorpusSchema { id_field: 2, ..CorpusSchema::default() };
        assert!(matches!(same.validate(), Err(IndexError::Config(_))));
    }

    #[test]
    fn parse_with_unvalidated_schema_reports_instead_of_panicking() {
        // min_fields says 2 is enough, but the text lives in field 5.
        let schema = CorpusSchema { text_field: 5, min_fields: 2, ..CorpusSchema::default() };
        let raw = RawRecord { line: 9, text: "tt01\tmovie\tThe Matrix".into() };
        match schema.parse(&raw) {
            Err(IndexError::Schema { line, expected, found }) => assert_eq!((line, expected, found), (9, 6, 3)),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_is_a_read_error() {
        let bytes: &[u8] = b"id\ttitle\n\xff\xfe\n";
        let mut reader = CorpusReader::new(Cursor::new(bytes), "bad.tsv", true);
        match reader.next() {
            Some(Err(IndexError::Io { stage: Stage::Read, .. })) => {}
            other => panic!("expected read error, got {other:?}"),
        }
    }
}
