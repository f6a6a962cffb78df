// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Measurement records and their CSV files.
//!
//! Every cell has one tracking file and one sweep file under the local root:
//! `TRACKING_DATA/CELL<id>_data.csv` and `JV_DATA/CELL<id>_JV_data.csv`.
//! Files get a header when they are created and are only ever appended to.
//! When a network root is configured, a finished file is copied there on a
//! worker thread. The copy is bounded by a timeout and its failure is only
//! logged.
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use octotrack_hw::AdcGain;
use octotrack_log::{debug, warn};

use crate::Result;

pub const TRACKING_DIR: &str = "TRACKING_DATA";
pub const SWEEP_DIR: &str = "JV_DATA";
pub const TRACKING_HEADER: &str =
    "timestamp,measured_voltage,measured_current,dac_value,adc_gain_v,adc_gain_c";
pub const SWEEP_HEADER: &str =
    "timestamp,set_voltage,measured_voltage,measured_current,dac_value,adc_gain_v,adc_gain_c";

const DEFAULT_MIRROR_TIMEOUT: Duration = Duration::from_secs(10);
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Local wall-clock time of a sample.
pub fn timestamp() -> NaiveDateTime {
    Local::now().naive_local()
}

/// One tracking iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingRecord {
    pub timestamp: NaiveDateTime,
    pub measured_voltage: f64,
    pub measured_current: f64,
    pub dac_value: u16,
    pub adc_gain_v: AdcGain,
    pub adc_gain_c: AdcGain,
}

impl TrackingRecord {
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.measured_voltage,
            self.measured_current,
            self.dac_value,
            self.adc_gain_v,
            self.adc_gain_c
        )
    }
}

/// One JV sweep point.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRecord {
    pub timestamp: NaiveDateTime,
    pub set_voltage: f64,
    pub measured_voltage: f64,
    pub measured_current: f64,
    pub dac_value: u16,
    pub adc_gain_v: AdcGain,
    pub adc_gain_c: AdcGain,
}

impl SweepRecord {
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.set_voltage,
            self.measured_voltage,
            self.measured_current,
            self.dac_value,
            self.adc_gain_v,
            self.adc_gain_c
        )
    }
}

/// Destination of the measurement records.
pub trait RecordSink {
    fn tracking_record(&mut self, cell_id: &str, record: &TrackingRecord) -> Result<()>;

    fn sweep_record(&mut self, cell_id: &str, record: &SweepRecord) -> Result<()>;

    /// Called once all tracking records of a pass over `cell_id` were written.
    fn finish_tracking(&mut self, _cell_id: &str) {}

    /// Called once a sweep of `cell_id` is complete.
    fn finish_sweep(&mut self, _cell_id: &str) {}
}

/// Keeps all records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub tracking: Vec<(String, TrackingRecord)>,
    pub sweeps: Vec<(String, SweepRecord)>,
    pub finished_tracking: Vec<String>,
    pub finished_sweeps: Vec<String>,
}

impl MemorySink {
    pub fn tracking_of<'a>(&'a self, cell_id: &'a str) -> impl Iterator<Item = &'a TrackingRecord> {
        self.tracking
            .iter()
            .filter(move |(id, _)| id == cell_id)
            .map(|(_, record)| record)
    }

    pub fn sweeps_of<'a>(&'a self, cell_id: &'a str) -> impl Iterator<Item = &'a SweepRecord> {
        self.sweeps
            .iter()
            .filter(move |(id, _)| id == cell_id)
            .map(|(_, record)| record)
    }
}

impl RecordSink for MemorySink {
    fn tracking_record(&mut self, cell_id: &str, record: &TrackingRecord) -> Result<()> {
        self.tracking.push((cell_id.to_string(), record.clone()));
        Ok(())
    }

    fn sweep_record(&mut self, cell_id: &str, record: &SweepRecord) -> Result<()> {
        self.sweeps.push((cell_id.to_string(), record.clone()));
        Ok(())
    }

    fn finish_tracking(&mut self, cell_id: &str) {
        self.finished_tracking.push(cell_id.to_string());
    }

    fn finish_sweep(&mut self, cell_id: &str) {
        self.finished_sweeps.push(cell_id.to_string());
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MirrorError {
    #[error("Copying {path} did not finish within {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("Copying {path} failed: {source}")]
    Failure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Writes the records as CSV files.
#[derive(Debug, Clone)]
pub struct DataLogger {
    local_root: PathBuf,
    network_root: Option<PathBuf>,
    mirror_timeout: Duration,
}

impl DataLogger {
    pub fn new(local_root: impl Into<PathBuf>, network_root: Option<PathBuf>) -> Self {
        DataLogger {
            local_root: local_root.into(),
            network_root,
            mirror_timeout: DEFAULT_MIRROR_TIMEOUT,
        }
    }

    pub fn with_mirror_timeout(mut self, timeout: Duration) -> Self {
        self.mirror_timeout = timeout;
        self
    }

    pub fn tracking_path(&self, cell_id: &str) -> PathBuf {
        self.local_root
            .join(TRACKING_DIR)
            .join(format!("CELL{cell_id}_data.csv"))
    }

    pub fn sweep_path(&self, cell_id: &str) -> PathBuf {
        self.local_root
            .join(SWEEP_DIR)
            .join(format!("CELL{cell_id}_JV_data.csv"))
    }

    /// Copy `file` into `<network root>/<subdir>/`.
    ///
    /// Returns once the copy finished or the timeout expired. A copy that
    /// timed out keeps running on its worker thread.
    pub fn mirror(&self, file: &Path, subdir: &str) -> Result<(), MirrorError> {
        let Some(network_root) = &self.network_root else {
            return Ok(());
        };
        let source = file.to_path_buf();
        let target_dir = network_root.join(subdir);
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            // The receiver is gone after a timeout.
            let _ = sender.send(copy_into(&source, &target_dir));
        });
        match receiver.recv_timeout(self.mirror_timeout) {
            Ok(Ok(())) => {
                debug!("Mirrored {}", file.display());
                Ok(())
            }
            Ok(Err(source)) => Err(MirrorError::Failure {
                path: file.to_path_buf(),
                source,
            }),
            Err(RecvTimeoutError::Timeout) => Err(MirrorError::Timeout {
                path: file.to_path_buf(),
                timeout: self.mirror_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(MirrorError::Failure {
                path: file.to_path_buf(),
                source: io::Error::other("copy worker stopped without a result"),
            }),
        }
    }

    fn mirror_logged(&self, file: &Path, subdir: &str) {
        if let Err(err) = self.mirror(file, subdir) {
            warn!("{}", err);
        }
    }
}

fn copy_into(source: &Path, target_dir: &Path) -> io::Result<()> {
    let name = source
        .file_name()
        .ok_or_else(|| io::Error::other(format!("{} has no file name", source.display())))?;
    fs::create_dir_all(target_dir)?;
    fs::copy(source, target_dir.join(name))?;
    Ok(())
}

/// Append `row`, creating the file with `header` first if needed.
fn append_row(path: &Path, header: &str, row: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "{header}")?;
    }
    writeln!(file, "{row}")
}

impl RecordSink for DataLogger {
    fn tracking_record(&mut self, cell_id: &str, record: &TrackingRecord) -> Result<()> {
        append_row(
            &self.tracking_path(cell_id),
            TRACKING_HEADER,
            &record.to_csv_row(),
        )?;
        Ok(())
    }

    fn sweep_record(&mut self, cell_id: &str, record: &SweepRecord) -> Result<()> {
        append_row(&self.sweep_path(cell_id), SWEEP_HEADER, &record.to_csv_row())?;
        Ok(())
    }

    fn finish_tracking(&mut self, cell_id: &str) {
        let path = self.tracking_path(cell_id);
        if path.exists() {
            self.mirror_logged(&path, TRACKING_DIR);
        }
    }

    fn finish_sweep(&mut self, cell_id: &str) {
        let path = self.sweep_path(cell_id);
        if path.exists() {
            self.mirror_logged(&path, SWEEP_DIR);
        }
    }
}


#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn fixed_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_micro_opt(9, 26, 53, 589_793)
            .unwrap()
    }

    fn tracking_record(voltage: f64) -> TrackingRecord {
        TrackingRecord {
            timestamp: fixed_time(),
            measured_voltage: voltage,
            measured_current: 0.0125,
            dac_value: 1234,
            adc_gain_v: AdcGain::Two,
            adc_gain_c: AdcGain::Eight,
        }
    }

    #[test]
    fn test_csv_rows() {
        assert_eq!(
            tracking_record(0.5).to_csv_row(),
            "2025-03-14T09:26:53.589793,0.5,0.0125,1234,2,8"
        );
        let record = SweepRecord {
            timestamp: fixed_time(),
            set_voltage: -0.3,
            measured_voltage: -0.29,
            measured_current: 0.02,
            dac_value: 293,
            adc_gain_v: AdcGain::Two,
            adc_gain_c: AdcGain::Eight,
        };
        assert_eq!(
            record.to_csv_row(),
            "2025-03-14T09:26:53.589793,-0.3,-0.29,0.02,293,2,8"
        );
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new(dir.path(), None);
        logger.tracking_record("4", &tracking_record(0.5)).unwrap();
        logger.tracking_record("4", &tracking_record(0.6)).unwrap();
        let path = dir.path().join("TRACKING_DATA").join("CELL4_data.csv");
        assert_eq!(logger.tracking_path("4"), path);
        let content = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TRACKING_HEADER);
        assert!(lines[2].ends_with(",0.6,0.0125,1234,2,8"));
    }

    #[test]
    fn test_existing_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("JV_DATA").join("CELL9_JV_data.csv");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("{SWEEP_HEADER}\nold row\n")).unwrap();
        let mut logger = DataLogger::new(dir.path(), None);
        let record = SweepRecord {
            timestamp: fixed_time(),
            set_voltage: 0.1,
            measured_voltage: 0.1,
            measured_current: 0.01,
            dac_value: 700,
            adc_gain_v: AdcGain::Two,
            adc_gain_c: AdcGain::Eight,
        };
        logger.sweep_record("9", &record).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.lines().filter(|l| *l == SWEEP_HEADER).count(), 1);
    }

    #[test]
    fn test_mirror_copies_file() {
        let local = tempfile::tempdir().unwrap();
        let network = tempfile::tempdir().unwrap();
        let mut logger = DataLogger::new(local.path(), Some(network.path().to_path_buf()));
        logger.tracking_record("1", &tracking_record(0.4)).unwrap();
        logger.finish_tracking("1");
        let copy = network.path().join(TRACKING_DIR).join("CELL1_data.csv");
        assert_eq!(
            fs::read_to_string(copy).unwrap(),
            fs::read_to_string(logger.tracking_path("1")).unwrap()
        );
    }

    #[test]
    fn test_mirror_failure_is_reported() {
        let local = tempfile::tempdir().unwrap();
        let network = tempfile::tempdir().unwrap();
        let logger = DataLogger::new(local.path(), Some(network.path().to_path_buf()));
        let missing = local.path().join("missing.csv");
        assert!(matches!(
            logger.mirror(&missing, TRACKING_DIR),
            Err(MirrorError::Failure { .. })
        ));
        // Without a network root there is nothing to do.
        let logger = DataLogger::new(local.path(), None);
        assert!(logger.mirror(&missing, TRACKING_DIR).is_ok());
    }
}
