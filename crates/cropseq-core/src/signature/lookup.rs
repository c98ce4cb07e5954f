//! Signature lookup table and its JSON sidecar.
//!
//! Sidecar layout, keyed by stringified code:
//! `{"<code>": {"values": [..], "years": [..], "count0": n, "count45": m}}`
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CropSeqError, Result};

/// Per-year history of one signature code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    /// Raw category per year, in year order.
    pub values: Vec<u8>,
    /// Years with any category (value > 0).
    pub count0: u32,
    /// Years holding the barren category.
    pub count45: u32,
}

impl LookupEntry {
    pub fn from_values(values: Vec<u8>, barren: u8) -> Self {
        let count0 = values.iter().filter(|&&v| v > 0).count() as u32;
        let count45 = values.iter().filter(|&&v| v == barren).count() as u32;
        Self { values, count0, count45 }
    }

    /// Years with a crop that was not barren.
    pub fn net_crop_years(&self) -> i64 {
        i64::from(self.count0) - i64::from(self.count45)
    }
}

/// Code → entry table for one encoding run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupTable {
    pub years: Vec<u16>,
    pub entries: BTreeMap<u32, LookupEntry>,
}

#[derive(Serialize, Deserialize)]
struct SidecarEntry {
    values: Vec<u8>,
    #[serde(default)]
    years: Vec<u16>,
    #[serde(default)]
    count0: u32,
    #[serde(default)]
    count45: u32,
}

/// Summary of a lookup table: signature count and count distributions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureStats {
    pub n_signatures: usize,
    pub years: Vec<u16>,
    pub count0_distribution: BTreeMap<u32, usize>,
    pub count45_distribution: BTreeMap<u32, usize>,
}

impl LookupTable {
    pub fn new(years: Vec<u16>) -> Self {
        Self { years, entries: BTreeMap::new() }
    }

    pub fn get(&self, code: u32) -> Option<&LookupEntry> {
        self.entries.get(&code)
    }

    pub fn insert(&mut self, code: u32, entry: LookupEntry) {
        self.entries.insert(code, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        let map: BTreeMap<String, SidecarEntry> = self
            .entries
            .iter()
            .map(|(code, e)| {
                (
                    code.to_string(),
                    SidecarEntry {
                        values: e.values.clone(),
                        years: self.years.clone(),
                        count0: e.count0,
                        count45: e.count45,
                    },
                )
            })
            .collect();
        Ok(serde_json::to_string(&map)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let map: BTreeMap<String, SidecarEntry> = serde_json::from_str(text)?;
        let mut table = LookupTable::default();
        for (key, raw) in map {
            let code: u32 = key
                .parse()
                .map_err(|_| CropSeqError::InvalidLookup(format!("non-integer code {key:?}")))?;
            if table.years.is_empty() {
                table.years = raw.years;
            }
            if !table.years.is_empty() && raw.values.len() != table.years.len() {
                return Err(CropSeqError::InvalidLookup(format!(
                    "code {code} has {} values for {} years",
                    raw.values.len(),
                    table.years.len()
                )));
            }
            table.entries.insert(
                code,
                LookupEntry { values: raw.values, count0: raw.count0, count45: raw.count45 },
            );
        }
        Ok(table)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn signature_stats(&self) -> SignatureStats {
        let mut count0_distribution = BTreeMap::new();
        let mut count45_distribution = BTreeMap::new();
        for e in self.entries.values() {
            *count0_distribution.entry(e.count0).or_insert(0) += 1;
            *count45_distribution.entry(e.count45).or_insert(0) += 1;
        }
        SignatureStats {
            n_signatures: self.entries.len(),
            years: self.years.clone(),
            count0_distribution,
            count45_distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LookupTable {
        let mut t = LookupTable::new(vec![2019, 2020, 2021]);
        t.insert(0, LookupEntry::from_values(vec![0, 0, 0], 45));
        t.insert(1, LookupEntry::from_values(vec![1, 45, 5], 45));
        t.insert(12, LookupEntry::from_values(vec![1, 1, 1], 45));
        t
    }

    #[test]
    fn counts_follow_values() {
        let e = LookupEntry::from_values(vec![1, 45, 0, 45], 45);
        assert_eq!((e.count0, e.count45), (3, 2));
        assert_eq!(e.net_crop_years(), 1);
    }

    #[test]
    fn sidecar_round_trip_keeps_years_and_counts() {
        let t = table();
        let json = t.to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["1"]["values"], serde_json::json!([1, 45, 5]));
        assert_eq!(v["1"]["years"], serde_json::json!([2019, 2020, 2021]));
        assert_eq!(v["1"]["count45"], 1);
        assert_eq!(LookupTable::from_json(&json).unwrap(), t);
    }

    #[test]
    fn rejects_bad_keys_and_lengths() {
        assert!(LookupTable::from_json(r#"{"x": {"values": [1]}}"#).is_err());
        let bad = r#"{"0": {"values": [1, 2], "years": [2020, 2021]}, "1": {"values": [3], "years": [2020, 2021]}}"#;
        assert!(matches!(LookupTable::from_json(bad), Err(CropSeqError::InvalidLookup(_))));
    }

    #[test]
    fn stats_histogram_counts() {
        let s = table().signature_stats();
        assert_eq!(s.n_signatures, 3);
        assert_eq!(s.count0_distribution[&0], 1);
        assert_eq!(s.count0_distribution[&3], 2);
        assert_eq!(s.count45_distribution[&1], 1);
    }
}
