//! A MapReduce-compatible implementation of word count.
//!

use anyhow::{anyhow, Context, Result};

use common::{Emit, KeyValue};

/// Lowercase `token` and strip everything that is not a letter or an ASCII
/// digit. Other numeric characters such as `½`, `²` or non-Latin digits are
/// dropped.
fn normalize(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphabetic() || c.is_ascii_digit())
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn map(kv: KeyValue, emit: &mut Emit<'_>) -> Result<()> {
    for word in kv.value.split_whitespace().map(normalize) {
        if !word.is_empty() {
            emit(KeyValue::new(word, "1"))?;
        }
    }
    Ok(())
}

pub fn reduce(key: &str, values: &mut dyn Iterator<Item = String>, emit: &mut Emit<'_>) -> Result<()> {
    let mut count = 0u64;
    for value in values {
        let n = value
            .parse::<u64>()
            .with_context(|| format!("count `{value}` for `{key}` is not a number"))?;
        count = count
            .checked_add(n)
            .ok_or_else(|| anyhow!("count for `{key}` overflows"))?;
    }
    emit(KeyValue::new(key, count.to_string()))
}
