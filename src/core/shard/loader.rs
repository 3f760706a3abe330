// src/core/shard/loader.rs

//! Parses the shard-key file format of the external interfaces section:
//! INI-ish sections naming a shard key, followed by whitespace-separated
//! `min max shard_id` triples. `#` starts a comment.

use super::table::{ShardKeyDescriptor, ShardKeyTable, ShardRange};
use crate::core::errors::BrokerError;
use std::path::Path;

pub fn load_file(path: &Path) -> Result<ShardKeyTable, BrokerError> {
    let text = std::fs::read_to_string(path).map_err(BrokerError::from)?;
    parse_str(&text)
}

pub fn parse_str(text: &str) -> Result<ShardKeyTable, BrokerError> {
    let mut descriptors: Vec<ShardKeyDescriptor> = Vec::new();
    let mut current: Option<ShardKeyDescriptor> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = match raw_line.find('#') {
            Some(idx) => &raw_line[..idx],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(d) = current.take() {
                descriptors.push(d);
            }
            current = Some(ShardKeyDescriptor {
                key_name: name.trim().to_string(),
                ranges: Vec::new(),
            });
            continue;
        }

        let descriptor = current.as_mut().ok_or_else(|| {
            BrokerError::Config(format!(
                "shard-key file line {}: range given before any [key] section",
                lineno + 1
            ))
        })?;

        let mut parts = line.split_whitespace();
        let min: i64 = parts
            .next()
            .ok_or_else(|| range_err(lineno, "missing min"))?
            .parse()?;
        let max: i64 = parts
            .next()
            .ok_or_else(|| range_err(lineno, "missing max"))?
            .parse()?;
        let shard_id: u32 = parts
            .next()
            .ok_or_else(|| range_err(lineno, "missing shard_id"))?
            .parse()?;
        if parts.next().is_some() {
            return Err(range_err(lineno, "too many fields, expected 'min max shard_id'"));
        }
        if min > max {
            return Err(range_err(lineno, "min > max"));
        }

        for existing in &descriptor.ranges {
            if min <= existing.max && existing.min <= max {
                return Err(BrokerError::Config(format!(
                    "shard-key file line {}: range [{min},{max}] overlaps an existing range in section '{}'",
                    lineno + 1,
                    descriptor.key_name
                )));
            }
        }

        descriptor.ranges.push(ShardRange { min, max, shard_id });
    }

    if let Some(d) = current.take() {
        descriptors.push(d);
    }

    Ok(ShardKeyTable::new(descriptors))
}

fn range_err(lineno: usize, msg: &str) -> BrokerError {
    BrokerError::Config(format!("shard-key file line {}: {msg}", lineno + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shard::table::ShardValue;

    const SAMPLE: &str = "\
[id]
# min max shard_id
0 127 0
128 255 1
";

    #[test]
    fn parses_sample_file() {
        let table = parse_str(SAMPLE).unwrap();
        assert_eq!(table.route("id", &ShardValue::Int(5), 256, None).unwrap(), 0);
        assert_eq!(table.route("id", &ShardValue::Int(200), 256, None).unwrap(), 1);
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let bad = "[id]\n0 127 0\n100 200 1\n";
        assert!(parse_str(bad).is_err());
    }

    #[test]
    fn rejects_range_outside_any_section() {
        let bad = "0 127 0\n";
        assert!(parse_str(bad).is_err());
    }

    #[test]
    fn round_trip_modulo_whitespace_and_comments() {
        let reparsed = parse_str(SAMPLE).unwrap();
        let direct = ShardKeyTable::new(vec![crate::core::shard::table::ShardKeyDescriptor {
            key_name: "id".into(),
            ranges: vec![
                crate::core::shard::table::ShardRange { min: 0, max: 127, shard_id: 0 },
                crate::core::shard::table::ShardRange { min: 128, max: 255, shard_id: 1 },
            ],
        }]);
        for v in [0i64, 50, 127, 128, 200, 255] {
            assert_eq!(
                reparsed.route("id", &ShardValue::Int(v), 256, None).unwrap(),
                direct.route("id", &ShardValue::Int(v), 256, None).unwrap()
            );
        }
    }
}
