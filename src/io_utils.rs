//! I/O utilities for raw CCD file drops.
//!
//! Every raw file read by the harmonizer flows through this module:
//!
//! - **Encoding**: labels resolve through `encoding_rs`, defaulting to UTF-8.
//!   Decoding is strict. A file that does not decode cleanly under the
//!   declared encoding is a fatal input-shape error; the encoding is never
//!   sniffed.
//! - **Delimiters**: `tab`, `comma`, `pipe` and single ASCII characters.
//! - **Reader construction**: CSV readers are never flexible, so a record
//!   whose field count differs from the header surfaces as an error.

use std::{fs, io::Read, path::Path};

use anyhow::{Context, Result, anyhow, bail};
use encoding_rs::{Encoding, UTF_8};

use crate::error::HarmonizeError;

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

/// Falls back on the file extension when no delimiter is declared.
pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("txt") => {
            DEFAULT_TSV_DELIMITER
        }
        _ => DEFAULT_CSV_DELIMITER,
    })
}

pub fn parse_delimiter(value: &str) -> Result<u8> {
    match value {
        "tab" | "\t" | "\\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let Some(first) = chars.next() else {
                bail!("Delimiter cannot be empty");
            };
            if chars.next().is_some() {
                bail!("Delimiter must be a single character");
            }
            if !first.is_ascii() {
                bail!("Delimiter must be ASCII");
            }
            Ok(first as u8)
        }
    }
}

pub fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        other => (other as char).to_string(),
    }
}

pub fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Result<String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        Err(anyhow!(
            "Failed to decode text with encoding {}",
            encoding.name()
        ))
    } else {
        Ok(text.into_owned())
    }
}

/// Reads a whole file and decodes it strictly with `encoding`.
///
/// A UTF-8 byte order mark is dropped by `encoding_rs`; any malformed
/// sequence fails with [`HarmonizeError::Encoding`].
pub fn read_decoded(path: &Path, encoding: &'static Encoding) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Opening input file {path:?}"))?;
    decode_bytes(&bytes, encoding).map_err(|_| {
        HarmonizeError::Encoding {
            path: path.display().to_string(),
            encoding: encoding.name().to_string(),
        }
        .into()
    })
}

pub fn open_csv_reader<R>(reader: R, delimiter: u8, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(false);
    builder.from_reader(reader)
}
