//! Batch chunking.

use crate::error::{Error, Result};
use crate::model::{Batch, WorkItem};

/// Split an ordered item list into fixed-size batches.
///
/// Deterministic and order-preserving: concatenating the result reproduces
/// the input. The final batch may be smaller than `chunk_size`.
pub fn split(items: Vec<WorkItem>, chunk_size: usize) -> Result<Vec<Batch>> {
    if chunk_size == 0 {
        return Err(Error::Config("chunk_size must be at least 1".into()));
    }

    let mut batches = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut buf = Vec::with_capacity(chunk_size);

    for item in items {
        buf.push(item);
        if buf.len() == chunk_size {
            batches.push(Batch {
                index: batches.len(),
                items: std::mem::replace(&mut buf, Vec::with_capacity(chunk_size)),
                attempt: 0,
            });
        }
    }

    if !buf.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            items: buf,
            attempt: 0,
        });
    }

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(format!("k{i}"), json!(i)))
            .collect()
    }

    #[test]
    fn zero_chunk_size_is_a_config_error() {
        let err = split(items(3), 0).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn concatenation_reproduces_input_for_all_sizes() {
        let n = 17;
        for chunk_size in 1..=n + 2 {
            let batches = split(items(n), chunk_size).unwrap();
            let keys: Vec<String> = batches
                .iter()
                .flat_map(|b| b.items.iter().map(|i| i.key.clone()))
                .collect();
            let expected: Vec<String> = (0..n).map(|i| format!("k{i}")).collect();
            assert_eq!(keys, expected, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn final_batch_may_be_short() {
        let batches = split(items(10), 4).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].items.len(), 4);
        assert_eq!(batches[1].items.len(), 4);
        assert_eq!(batches[2].items.len(), 2);
    }

    #[test]
    fn indexes_are_sequential() {
        let batches = split(items(9), 2).unwrap();
        let indexes: Vec<usize> = batches.iter().map(|b| b.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(split(Vec::new(), 5).unwrap().is_empty());
    }
}
