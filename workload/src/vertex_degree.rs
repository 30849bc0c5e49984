//! A MapReduce-compatible application that computes the
//! degree of each vertex in a graph, given a list of edges.
//!

use anyhow::{anyhow, Result};

use common::{Emit, KeyValue};

fn parse_line(line: &str) -> Result<(u64, u64)> {
    let mut iter = line.split_whitespace().take(2);
    let a = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    let b = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    Ok((a, b))
}

/// Each non-blank line of the value is an edge `a b`; both ends gain one degree.
pub fn map(kv: KeyValue, emit: &mut Emit<'_>) -> Result<()> {
    for line in kv.value.lines().filter(|l| !l.trim().is_empty()) {
        let (a, b) = parse_line(line)?;
        emit(KeyValue::new(a.to_string(), "1"))?;
        emit(KeyValue::new(b.to_string(), "1"))?;
    }
    Ok(())
}

pub fn reduce(key: &str, values: &mut dyn Iterator<Item = String>, emit: &mut Emit<'_>) -> Result<()> {
    let mut count = 0u64;

    for value in values {
        count = count
            .checked_add(value.parse::<u64>()?)
            .ok_or_else(|| anyhow!("degree of `{key}` overflows"))?;
    }

    emit(KeyValue::new(key, format!("deg={count}")))
}
