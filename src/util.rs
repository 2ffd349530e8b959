use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use sha2::{Digest, Sha256};

use crate::model::PipelineKind;

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn run_name<Tz: TimeZone>(kind: PipelineKind, now: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}_{}", kind.as_str(), now.format("%Y%m%d_%H%M%S"))
}

pub fn run_name_now(kind: PipelineKind) -> String {
    run_name(kind, Local::now())
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];

    loop {
        let count = file
            .read(&mut buf)
            .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    // Four-space indent, no trailing newline.
    let mut data = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut data, formatter);
    value
        .serialize(&mut serializer)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;

    let mut file = File::create(path)
        .with_context(|| format!("failed to create json file: {}", path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("failed to write json file: {}", path.display()))?;

    Ok(())
}

/// Moves a file, falling back to copy + remove when `rename` cannot cross
/// filesystems.
pub fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }

    fs::copy(source, destination).with_context(|| {
        format!(
            "failed to move {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    fs::remove_file(source)
        .with_context(|| format!("failed to remove moved file: {}", source.display()))?;

    Ok(())
}

pub fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<u64> {
    ensure_directory(destination)?;

    let mut copied = 0_u64;
    let entries = fs::read_dir(source)
        .with_context(|| format!("failed to read directory: {}", source.display()))?;

    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", source.display()))?;
        let path = entry.path();
        let target = destination.join(entry.file_name());

        if path.is_dir() {
            copied += copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target).with_context(|| {
                format!("failed to copy {} to {}", path.display(), target.display())
            })?;
            copied += 1;
        }
    }

    Ok(copied)
}

pub fn short_prefix(value: &str, len: usize) -> &str {
    match value.char_indices().nth(len) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use super::*;

    #[test]
    fn run_name_uses_pipeline_tag_and_second_granularity() {
        let offset = FixedOffset::east_opt(0).expect("zero offset");
        let ts = offset
            .with_ymd_and_hms(2024, 3, 1, 14, 22, 33)
            .single()
            .expect("valid timestamp");

        assert_eq!(run_name(PipelineKind::Train, ts), "train_20240301_142233");
        assert_eq!(
            run_name(PipelineKind::Predict, ts),
            "predict_20240301_142233"
        );
    }

    #[test]
    fn short_prefix_truncates_and_tolerates_short_values() {
        assert_eq!(short_prefix("0123456789abcdef", 8), "01234567");
        assert_eq!(short_prefix("abc", 8), "abc");
        assert_eq!(short_prefix("", 8), "");
    }

    #[test]
    fn json_is_written_with_four_space_indent() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("out.json");

        write_json_pretty(&path, &serde_json::json!([{"image_name": "dog.jpg"}]))
            .expect("write json");

        let written = fs::read_to_string(&path).expect("read json");
        assert_eq!(written, "[\n    {\n        \"image_name\": \"dog.jpg\"\n    }\n]");
    }

    #[test]
    fn move_file_relocates_and_consumes_source() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let source = dir.path().join("a.jpg");
        let destination = dir.path().join("b.jpg");
        fs::write(&source, b"pixels").expect("write source");

        move_file(&source, &destination).expect("move");

        assert!(!source.exists());
        assert_eq!(fs::read(&destination).expect("read"), b"pixels");
    }

    #[test]
    fn copy_dir_recursive_copies_nested_files() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("nested")).expect("mkdir");
        fs::write(source.join("one.txt"), b"1").expect("write");
        fs::write(source.join("nested").join("two.txt"), b"2").expect("write");

        let copied = copy_dir_recursive(&source, &dir.path().join("dst")).expect("copy");

        assert_eq!(copied, 2);
        assert!(dir.path().join("dst").join("nested").join("two.txt").exists());
    }
}
