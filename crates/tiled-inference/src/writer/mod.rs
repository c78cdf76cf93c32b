//! Writers for retrieval results.
//!
//! Results are stored as Zarr V3 hierarchies: one group holding the global
//! attributes and one array per variable and coordinate.

mod zarr_writer;

use chrono::{DateTime, Utc};

pub use zarr_writer::{ZarrWriteResult, ZarrWriter};

/// Name of the output file for an input of kind `kind` (e.g. `gridsat`)
/// whose first observation is at `date`.
pub fn output_filename(kind: &str, date: DateTime<Utc>) -> String {
    format!("ccic_{}_{}.zarr", kind, date.format("%Y%m%d%H%M"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_output_filename() {
        let date = Utc.with_ymd_and_hms(2020, 3, 7, 9, 30, 0).unwrap();
        assert_eq!(output_filename("cpcir", date), "ccic_cpcir_202003070930.zarr");
    }
}
