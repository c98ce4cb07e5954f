//! Temporal signature encoding.
//!
//! Each pixel's per-year categories are packed as base-256 digits into one
//! `u64` (`combined = Σ v_i · 256^i`, year 0 in the lowest byte). Distinct
//! combined values are replaced by dense `u32` codes:
//!
//! * whole-array mode assigns codes in ascending combined-value order;
//! * windowed mode walks fixed pixel windows in sequence and assigns codes in
//!   first-seen order through one [`SignatureTable`] shared by every window.
pub mod lookup;

use std::collections::HashMap;

use log::{debug, info};

use crate::error::{CropSeqError, Result};
use crate::raster::{generate_windows, CategoryRaster, CodedRaster, Raster, RasterSource, Stack};
use lookup::{LookupEntry, LookupTable};

/// Largest number of years a `u64` signature can hold.
pub const MAX_YEARS: usize = 8;

/// Code written for pixels that are nodata in every year. Never a lookup key.
pub const NODATA_CODE: u32 = u32::MAX;

/// Fail fast when `n_years` would not fit the 64-bit accumulator.
pub fn check_year_count(n_years: usize) -> Result<()> {
    if n_years == 0 {
        return Err(CropSeqError::EmptyStack);
    }
    if n_years > MAX_YEARS {
        return Err(CropSeqError::EncodingOverflow { years: n_years, max: MAX_YEARS });
    }
    Ok(())
}

#[inline]
fn pack(values: &[u8]) -> u64 {
    values
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &v)| acc | (u64::from(v) << (8 * i)))
}

/// Pack per-year values into one signature value.
pub fn combine_values(values: &[u8]) -> Result<u64> {
    check_year_count(values.len())?;
    Ok(pack(values))
}

/// Inverse of [`combine_values`].
pub fn decode_combined(combined: u64, n_years: usize) -> Vec<u8> {
    (0..n_years).map(|i| ((combined >> (8 * i)) & 0xFF) as u8).collect()
}

// ── Shared table ─────────────────────────────────────────────────────────────

/// Append-only combined-value → code table.
///
/// Codes are handed out in first-seen order and never change once issued,
/// so every window (or tile) that interns the same signature gets the same
/// code. Wrap in a `Mutex` to share between threads.
#[derive(Debug, Clone)]
pub struct SignatureTable {
    n_years: usize,
    barren_value: u8,
    codes: HashMap<u64, u32>,
    combined: Vec<u64>,
}

impl SignatureTable {
    pub fn new(n_years: usize, barren_value: u8) -> Result<Self> {
        check_year_count(n_years)?;
        Ok(Self {
            n_years,
            barren_value,
            codes: HashMap::new(),
            combined: Vec::new(),
        })
    }

    pub fn n_years(&self) -> usize {
        self.n_years
    }

    pub fn len(&self) -> usize {
        self.combined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }

    /// Code for `combined`, issuing the next one if it is new.
    pub fn intern(&mut self, combined: u64) -> Result<u32> {
        if let Some(&code) = self.codes.get(&combined) {
            return Ok(code);
        }
        let next = self.combined.len();
        if next >= NODATA_CODE as usize {
            return Err(CropSeqError::CodeSpaceExhausted(NODATA_CODE));
        }
        let code = next as u32;
        self.codes.insert(combined, code);
        self.combined.push(combined);
        Ok(code)
    }

    pub fn code_of(&self, combined: u64) -> Option<u32> {
        self.codes.get(&combined).copied()
    }

    pub fn decode(&self, code: u32) -> Option<Vec<u8>> {
        self.combined
            .get(code as usize)
            .map(|&c| decode_combined(c, self.n_years))
    }

    /// Intern every signature of a per-tile lookup and return the local → shared
    /// code translation.
    pub fn absorb(&mut self, local: &LookupTable) -> Result<HashMap<u32, u32>> {
        let mut remap = HashMap::with_capacity(local.len());
        for (&code, entry) in &local.entries {
            let shared = self.intern(combine_values(&entry.values)?)?;
            remap.insert(code, shared);
        }
        Ok(remap)
    }

    pub fn to_lookup(&self, years: &[u16]) -> LookupTable {
        let mut table = LookupTable::new(years.to_vec());
        for (code, &c) in self.combined.iter().enumerate() {
            let values = decode_combined(c, self.n_years);
            table.insert(code as u32, LookupEntry::from_values(values, self.barren_value));
        }
        table
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Combined value per pixel; `None` where every year is nodata.
fn combined_pixels(stack: &Stack) -> Vec<Option<u64>> {
    let nodata = stack.nodata();
    let n = stack.width() * stack.height();
    let mut values = vec![0u8; stack.n_years()];
    let mut out = Vec::with_capacity(n);
    for idx in 0..n {
        stack.pixel_values(idx, &mut values);
        let all_nodata = nodata.is_some_and(|nd| values.iter().all(|&v| v == nd));
        out.push((!all_nodata).then(|| pack(&values)));
    }
    out
}

fn coded_like(stack: &Stack, data: Vec<u32>) -> Result<CodedRaster> {
    let nodata = stack.nodata().map(|_| NODATA_CODE);
    Ok(Raster::from_vec(data, stack.width(), stack.height(), stack.transform(), stack.crs())?.with_nodata(nodata))
}

/// Whole-array encoding: every distinct signature in `stack` gets a code,
/// in ascending combined-value order.
pub fn encode_stack(stack: &Stack, barren_value: u8) -> Result<(CodedRaster, LookupTable)> {
    check_year_count(stack.n_years())?;
    let combined = combined_pixels(stack);

    let mut distinct: Vec<u64> = combined.iter().flatten().copied().collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() >= NODATA_CODE as usize {
        return Err(CropSeqError::CodeSpaceExhausted(NODATA_CODE));
    }

    let data = combined
        .iter()
        .map(|c| match c {
            // Present by construction.
            Some(v) => distinct.binary_search(v).map_or(NODATA_CODE, |i| i as u32),
            None => NODATA_CODE,
        })
        .collect();

    let mut lookup = LookupTable::new(stack.years.clone());
    for (code, &c) in distinct.iter().enumerate() {
        let values = decode_combined(c, stack.n_years());
        lookup.insert(code as u32, LookupEntry::from_values(values, barren_value));
    }
    debug!("encoded {}x{} stack: {} signatures", stack.width(), stack.height(), lookup.len());
    Ok((coded_like(stack, data)?, lookup))
}

/// Encode one window against the shared table. Signatures new to the table
/// are interned in ascending combined-value order within the window.
pub fn encode_window(stack: &Stack, table: &mut SignatureTable) -> Result<CodedRaster> {
    if stack.n_years() != table.n_years() {
        return Err(CropSeqError::YearCountMismatch {
            years: table.n_years(),
            layers: stack.n_years(),
        });
    }
    let combined = combined_pixels(stack);

    let mut distinct: Vec<u64> = combined.iter().flatten().copied().collect();
    distinct.sort_unstable();
    distinct.dedup();
    let mut codes = Vec::with_capacity(distinct.len());
    for &c in &distinct {
        codes.push(table.intern(c)?);
    }

    let data = combined
        .iter()
        .map(|c| match c {
            Some(v) => distinct.binary_search(v).map_or(NODATA_CODE, |i| codes[i]),
            None => NODATA_CODE,
        })
        .collect();
    coded_like(stack, data)
}

/// Windowed encoding of a full raster set. Windows are processed strictly
/// in row-major order and written straight into the target raster.
pub fn encode_windowed<S: RasterSource + ?Sized>(
    sources: &[(u16, &S)],
    window_size: usize,
    table: &mut SignatureTable,
) -> Result<CodedRaster> {
    let Some((_, first)) = sources.first() else {
        return Err(CropSeqError::EmptyStack);
    };
    let (width, height) = (first.width(), first.height());
    for (_, s) in &sources[1..] {
        if s.width() != width || s.height() != height {
            return Err(CropSeqError::ShapeMismatch {
                expected_width: width,
                expected_height: height,
                width: s.width(),
                height: s.height(),
            });
        }
        if s.transform() != first.transform() {
            return Err(CropSeqError::TransformMismatch);
        }
    }

    let shared_nodata = first
        .nodata()
        .filter(|nd| sources.iter().all(|(_, s)| s.nodata() == Some(*nd)));
    let mut target = Raster::new(width, height, first.transform(), first.crs(), NODATA_CODE)
        .with_nodata(shared_nodata.map(|_| NODATA_CODE));

    let windows = generate_windows(width, height, window_size);
    info!("encoding {}x{} raster in {} windows", width, height, windows.len());
    for (i, window) in windows.iter().enumerate() {
        let stack = Stack::read(sources, window)?;
        let block = encode_window(&stack, table)?;
        target.write_block(window.col_off, window.row_off, &block)?;
        debug!("window {}/{}: {} signatures so far", i + 1, windows.len(), table.len());
    }
    Ok(target)
}

/// Windowed encoding of an in-memory stack; convenience over [`encode_windowed`].
pub fn encode_stack_windowed(stack: &Stack, window_size: usize, table: &mut SignatureTable) -> Result<CodedRaster> {
    let sources: Vec<(u16, &CategoryRaster)> =
        stack.years.iter().copied().zip(stack.layers.iter()).collect();
    encode_windowed(&sources, window_size, table)
}
