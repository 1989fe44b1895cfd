use serde::Serialize;

/// Records that fit the byte budget, plus how many were dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shaped<T> {
    pub records: Vec<T>,
    pub truncated: bool,
    pub omitted: usize,
}

/// Keeps serialized tool responses under a byte budget by dropping trailing
/// records. Order is preserved, so callers should sort by relevance first.
#[derive(Debug, Clone, Copy)]
pub struct ResponseShaper {
    max_bytes: usize,
}

impl ResponseShaper {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// `overhead` is the serialized size of everything around the records.
    pub fn fit<T: Serialize>(
        &self,
        mut records: Vec<T>,
        overhead: usize,
    ) -> Result<Shaped<T>, serde_json::Error> {
        // Brackets of the array itself.
        let mut used = overhead.saturating_add(2);
        let mut keep = 0;
        for record in &records {
            let size = serde_json::to_vec(record)?.len() + usize::from(keep > 0);
            if used.saturating_add(size) > self.max_bytes {
                break;
            }
            used += size;
            keep += 1;
        }
        let omitted = records.len() - keep;
        records.truncate(keep);
        Ok(Shaped {
            records,
            truncated: omitted > 0,
            omitted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_everything_under_budget() {
        let shaped = ResponseShaper::new(1_000)
            .fit(vec![json!({"id": "1"}), json!({"id": "2"})], 10)
            .unwrap();
        assert_eq!(shaped.records.len(), 2);
        assert!(!shaped.truncated);
        assert_eq!(shaped.omitted, 0);
    }

    #[test]
    fn drops_trailing_records_to_fit() {
        let records: Vec<_> = (0..10).map(|i| json!({"id": i.to_string()})).collect();
        let one = serde_json::to_vec(&records[0]).unwrap().len();
        // Room for exactly three records and their separators.
        let budget = 2 + one * 3 + 2;
        let shaped = ResponseShaper::new(budget).fit(records, 0).unwrap();

        assert_eq!(shaped.records.len(), 3);
        assert!(shaped.truncated);
        assert_eq!(shaped.omitted, 7);
        assert!(serde_json::to_vec(&shaped.records).unwrap().len() <= budget);
    }

    #[test]
    fn tiny_budget_keeps_nothing() {
        let shaped = ResponseShaper::new(4).fit(vec![json!({"id": "1"})], 10).unwrap();
        assert!(shaped.records.is_empty());
        assert_eq!(shaped.omitted, 1);
    }
}
