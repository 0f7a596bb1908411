//! LSN (Log Sequence Number) utilities for PostgreSQL replication.

use crate::error::{Error, Result};

/// Parse LSN from "X/Y" format to u64.
pub fn parse_lsn(lsn: &str) -> Result<u64> {
    let (high, low) = lsn
        .split_once('/')
        .ok_or_else(|| Error::InvalidLsn(lsn.to_string()))?;

    let high = u32::from_str_radix(high, 16).map_err(|_| Error::InvalidLsn(lsn.to_string()))?;
    let low = u32::from_str_radix(low, 16).map_err(|_| Error::InvalidLsn(lsn.to_string()))?;

    Ok((u64::from(high) << 32) | u64::from(low))
}

/// Format u64 LSN to "X/Y" format.
pub fn format_lsn(lsn: u64) -> String {
    let high = lsn >> 32;
    let low = lsn & 0xFFFFFFFF;
    format!("{:X}/{:X}", high, low)
}
