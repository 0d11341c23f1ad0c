//! NMEA-0183 GPS receiver source
//!
//! Reads sentences from a serial GNSS receiver and pushes position
//! samples to subscribers. Sentence handling:
//! - RMC carries the ground speed and is the one sample emitter
//! - VTG repeats the ground speed and is recognized but never emitted
//! - GGA supplies the HDOP used by the accuracy gate
//!
//! Checksum: XOR of all bytes between '$' and '*', two hex digits.

use crate::domain::types::{AccuracyTier, Permission, PositionSample, SubscribeConfig};
use crate::infra::metrics::Metrics;
use crate::io::source::{LocationSource, Subscription, SAMPLE_CHANNEL_SIZE};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use smallvec::SmallVec;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

/// Knots to meters per second (1 knot = 1852 m per hour)
const KNOTS_TO_MPS: f64 = 1852.0 / 3600.0;

/// NMEA sentences are at most 82 characters; a buffer past this size
/// without a terminator means the line stream is garbage
const MAX_SENTENCE_LEN: usize = 1024;

/// Minimum interval between channel-full warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A checksum-valid sentence
#[derive(Debug, PartialEq)]
pub(crate) enum Sentence {
    /// RMC with an active fix
    Rmc(RmcData),
    /// RMC with void status (receiver has no fix yet)
    RmcVoid,
    /// Course over ground; carries the same speed RMC already delivers
    Vtg,
    /// Fix quality
    Gga(GgaData),
    /// Valid sentence type this source does not use
    Other,
}

#[derive(Debug, PartialEq)]
pub(crate) struct RmcData {
    pub speed_mps: f64,
    pub lat: f64,
    pub lon: f64,
    pub fix_time_ms: Option<u64>,
}

#[derive(Debug, PartialEq)]
pub(crate) struct GgaData {
    pub hdop: Option<f64>,
}

/// Parse one NMEA line. Returns None for malformed framing, checksum
/// mismatch, or unparsable fields.
pub(crate) fn parse_sentence(line: &str) -> Option<Sentence> {
    let line = line.trim();
    if !line.starts_with('$') {
        return None;
    }

    let star = line.rfind('*')?;
    let payload = &line[1..star];
    let checksum_str = &line[star + 1..];
    if checksum_str.len() != 2 {
        return None;
    }
    let expected = u8::from_str_radix(checksum_str, 16).ok()?;
    let actual = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return None;
    }

    let fields: SmallVec<[&str; 16]> = payload.split(',').collect();
    let talker = fields.first()?;
    if talker.len() < 3 {
        return Some(Sentence::Other);
    }

    // Match on the sentence id only, so GPRMC and GNRMC both parse.
    // NMEA payloads are ASCII; get() bails on multi-byte garbage that
    // happens to pass the checksum instead of slicing mid-character.
    match talker.get(talker.len() - 3..)? {
        "RMC" => parse_rmc(&fields),
        "VTG" => Some(Sentence::Vtg),
        "GGA" => parse_gga(&fields),
        _ => Some(Sentence::Other),
    }
}

fn parse_rmc(fields: &[&str]) -> Option<Sentence> {
    if fields.len() < 10 {
        return None;
    }

    match fields[2] {
        "A" => {}
        "V" => return Some(Sentence::RmcVoid),
        _ => return None,
    }

    let speed_knots: f64 = fields[7].parse().ok()?;
    let lat = parse_coord(fields[3], fields[4])?;
    let lon = parse_coord(fields[5], fields[6])?;
    let fix_time_ms = parse_fix_time(fields[9], fields[1]);

    Some(Sentence::Rmc(RmcData { speed_mps: speed_knots * KNOTS_TO_MPS, lat, lon, fix_time_ms }))
}

fn parse_gga(fields: &[&str]) -> Option<Sentence> {
    if fields.len() < 9 {
        return None;
    }
    let hdop = if fields[8].is_empty() { None } else { Some(fields[8].parse::<f64>().ok()?) };
    Some(Sentence::Gga(GgaData { hdop }))
}

/// Convert ddmm.mmmm (or dddmm.mmmm) plus hemisphere to decimal degrees
fn parse_coord(value: &str, hemisphere: &str) -> Option<f64> {
    let dot = value.find('.')?;
    if dot < 3 {
        return None;
    }
    let degrees: f64 = value.get(..dot - 2)?.parse().ok()?;
    let minutes: f64 = value.get(dot - 2..)?.parse().ok()?;
    let coord = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Some(coord),
        "S" | "W" => Some(-coord),
        _ => None,
    }
}

/// Combine ddmmyy and hhmmss.sss into epoch milliseconds.
/// Two-digit years are 2000-based.
fn parse_fix_time(date: &str, time: &str) -> Option<u64> {
    if date.len() != 6 || time.len() < 6 {
        return None;
    }

    let day: u32 = date.get(0..2)?.parse().ok()?;
    let month: u32 = date.get(2..4)?.parse().ok()?;
    let year: i32 = 2000 + date.get(4..6)?.parse::<i32>().ok()?;

    let hour: u32 = time.get(0..2)?.parse().ok()?;
    let minute: u32 = time.get(2..4)?.parse().ok()?;
    let second: f64 = time.get(4..)?.parse().ok()?;
    let millis = (second * 1000.0).round() as u32;

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = NaiveTime::from_hms_milli_opt(hour, minute, millis / 1000, millis % 1000)?;
    Some(date.and_time(time).and_utc().timestamp_millis() as u64)
}

/// Maximum HDOP accepted for each accuracy tier. None is unbounded.
fn hdop_limit(tier: AccuracyTier) -> Option<f64> {
    match tier {
        AccuracyTier::Best => Some(2.0),
        AccuracyTier::High => Some(5.0),
        AccuracyTier::Balanced => Some(10.0),
        AccuracyTier::Low => None,
    }
}

/// Equirectangular distance in meters. Good to well under a percent at
/// the few-hundred-meter scale the distance filter works with.
fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let dx = (lon2 - lon1).to_radians() * mean_lat.cos();
    let dy = (lat2 - lat1).to_radians();
    (dx * dx + dy * dy).sqrt() * EARTH_RADIUS_M
}

/// Serial GNSS receiver speaking NMEA-0183
pub struct NmeaSource {
    device: String,
    baud: u32,
    metrics: Option<Arc<Metrics>>,
}

impl NmeaSource {
    pub fn new(device: impl Into<String>, baud: u32) -> Self {
        Self { device: device.into(), baud, metrics: None }
    }

    /// Attach a metrics collector for drop and invalid-sentence counters
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Opening the device is the only access check available on a serial
    /// receiver, so both the status query and the request are probes.
    fn probe_device(&self) -> Permission {
        match tokio_serial::new(&self.device, self.baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
        {
            Ok(_) => Permission::Granted,
            Err(e) => classify_open_error(&e),
        }
    }
}

fn classify_open_error(e: &tokio_serial::Error) -> Permission {
    match e.kind() {
        // EACCES on the device node does not clear without operator action
        tokio_serial::ErrorKind::Io(ErrorKind::PermissionDenied) => Permission::DeniedForever,
        // Missing or busy devices may appear on a later probe
        _ => Permission::Undetermined,
    }
}

#[async_trait]
impl LocationSource for NmeaSource {
    fn kind(&self) -> &'static str {
        "nmea"
    }

    async fn is_service_enabled(&self) -> bool {
        tokio::fs::metadata(&self.device).await.is_ok()
    }

    async fn permission_status(&self) -> Permission {
        self.probe_device()
    }

    async fn request_permission(&self) -> Permission {
        self.probe_device()
    }

    async fn subscribe(&self, config: SubscribeConfig) -> anyhow::Result<Subscription> {
        // Open before spawning anything so a failure leaves no task behind
        let port = tokio_serial::new(&self.device, self.baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .with_context(|| format!("Failed to open NMEA device {}", self.device))?;

        info!(
            device = %self.device,
            baud = %self.baud,
            accuracy = %config.accuracy.as_str(),
            min_distance_m = %config.min_distance_m,
            "nmea_port_opened"
        );

        let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_SIZE);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let reader = NmeaReader::new(config.accuracy, config.min_distance_m, self.metrics.clone());
        tokio::spawn(reader.run(port, tx, cancel_rx));

        Ok(Subscription::new(rx, cancel_tx))
    }
}

/// Reader task state for one subscription
struct NmeaReader {
    accuracy: AccuracyTier,
    min_distance_m: f64,
    metrics: Option<Arc<Metrics>>,
    /// Persistent buffer accumulating bytes across reads. Sentences can
    /// arrive split across chunks, so partial lines are kept for the
    /// next read.
    line_buffer: Vec<u8>,
    /// HDOP from the most recent GGA sentence
    last_hdop: Option<f64>,
    /// Position of the last delivered sample, for the distance filter
    last_position: Option<(f64, f64)>,
    last_drop_warn: Option<Instant>,
}

impl NmeaReader {
    fn new(accuracy: AccuracyTier, min_distance_m: f64, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            accuracy,
            min_distance_m,
            metrics,
            line_buffer: Vec::with_capacity(256),
            last_hdop: None,
            last_position: None,
            last_drop_warn: None,
        }
    }

    async fn run(
        mut self,
        mut port: tokio_serial::SerialStream,
        tx: mpsc::Sender<PositionSample>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut read_buf = [0u8; 256];

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
                result = port.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            warn!("nmea_port_eof");
                            break;
                        }
                        Ok(n) => {
                            self.line_buffer.extend_from_slice(&read_buf[..n]);
                            if !self.drain_lines(&tx) {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => {
                            // Quiet port, keep waiting
                        }
                        Err(e) => {
                            warn!(error = %e, "nmea_read_error");
                            break;
                        }
                    }
                }
            }
        }

        info!("nmea_reader_stopped");
    }

    /// Extract complete lines from the buffer and process each.
    /// Returns false once the receiver side is gone.
    fn drain_lines(&mut self, tx: &mpsc::Sender<PositionSample>) -> bool {
        while let Some(pos) = self.line_buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            match std::str::from_utf8(&line) {
                Ok(text) => {
                    if !self.handle_line(text, tx) {
                        return false;
                    }
                }
                Err(_) => self.record_invalid(&line),
            }
        }

        if self.line_buffer.len() > MAX_SENTENCE_LEN {
            debug!(len = self.line_buffer.len(), "nmea_buffer_overflow_cleared");
            if let Some(m) = &self.metrics {
                m.record_invalid_sentence();
            }
            self.line_buffer.clear();
        }

        true
    }

    fn handle_line(&mut self, line: &str, tx: &mpsc::Sender<PositionSample>) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }

        match parse_sentence(line) {
            Some(Sentence::Rmc(rmc)) => return self.handle_fix(rmc, tx),
            Some(Sentence::RmcVoid) => {
                tracing::trace!("nmea_fix_void");
            }
            Some(Sentence::Gga(gga)) => {
                self.last_hdop = gga.hdop;
            }
            // Emitting VTG as well would double the sample rate
            Some(Sentence::Vtg) | Some(Sentence::Other) => {}
            None => self.record_invalid(line.as_bytes()),
        }

        true
    }

    fn handle_fix(&mut self, rmc: RmcData, tx: &mpsc::Sender<PositionSample>) -> bool {
        // Accuracy gate: reject fixes whose dilution exceeds the tier bound
        if let (Some(limit), Some(hdop)) = (hdop_limit(self.accuracy), self.last_hdop) {
            if hdop > limit {
                tracing::trace!(hdop = %hdop, "nmea_fix_rejected_hdop");
                return true;
            }
        }

        // Distance filter: skip fixes closer than min_distance_m to the
        // last delivered one. 0.0 delivers everything.
        if self.min_distance_m > 0.0 {
            if let Some((last_lat, last_lon)) = self.last_position {
                let dist = distance_m(last_lat, last_lon, rmc.lat, rmc.lon);
                if dist < self.min_distance_m {
                    tracing::trace!(
                        distance_m = format!("{:.1}", dist),
                        "nmea_fix_below_min_distance"
                    );
                    return true;
                }
            }
        }
        self.last_position = Some((rmc.lat, rmc.lon));

        let sample = PositionSample {
            speed_mps: rmc.speed_mps,
            fix_time_ms: rmc.fix_time_ms,
            received_at: Instant::now(),
        };

        match tx.try_send(sample) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                if let Some(m) = &self.metrics {
                    m.record_sample_dropped();
                }
                // Rate-limit the warning; a slow consumer drops every sample
                let now = Instant::now();
                if self.last_drop_warn.map_or(true, |t| now.duration_since(t) >= DROP_WARN_INTERVAL)
                {
                    warn!("nmea_sample_dropped_channel_full");
                    self.last_drop_warn = Some(now);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }

        true
    }

    fn record_invalid(&self, raw: &[u8]) {
        debug!(raw = %hex::encode(raw), "nmea_invalid_sentence");
        if let Some(m) = &self.metrics {
            m.record_invalid_sentence();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RMC_FIX: &str = "$GPRMC,120000.00,A,6408.9000,N,02156.5000,W,10.0,84.4,170825,,,A*49";
    const GGA_GOOD: &str =
        "$GPGGA,120000.00,6408.9000,N,02156.5000,W,1,08,1.2,36.0,M,66.0,M,,*45";
    const GGA_POOR: &str =
        "$GPGGA,120000.00,6408.9000,N,02156.5000,W,1,08,9.9,36.0,M,66.0,M,,*46";

    #[test]
    fn test_parse_rmc_active_fix() {
        let parsed = parse_sentence(RMC_FIX).unwrap();
        match parsed {
            Sentence::Rmc(rmc) => {
                assert!((rmc.speed_mps - 10.0 * KNOTS_TO_MPS).abs() < 1e-9);
                assert!((rmc.lat - 64.148_333_33).abs() < 1e-6);
                assert!((rmc.lon - (-21.941_666_67)).abs() < 1e-6);
                // 2025-08-17T12:00:00Z
                assert_eq!(rmc.fix_time_ms, Some(1_755_432_000_000));
            }
            other => panic!("expected Rmc, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rmc_alternate_talker() {
        let parsed =
            parse_sentence("$GNRMC,120000.00,A,6408.9000,N,02156.5000,W,27.0,84.4,170825,,,A*53")
                .unwrap();
        match parsed {
            Sentence::Rmc(rmc) => assert!((rmc.speed_mps - 27.0 * KNOTS_TO_MPS).abs() < 1e-9),
            other => panic!("expected Rmc, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rmc_void_status() {
        let parsed = parse_sentence("$GPRMC,120000.00,V,,,,,,,170825,,,N*77").unwrap();
        assert_eq!(parsed, Sentence::RmcVoid);
    }

    #[test]
    fn test_parse_vtg_recognized() {
        let parsed = parse_sentence("$GPVTG,84.4,T,,M,10.0,N,18.5,K,A*38").unwrap();
        assert_eq!(parsed, Sentence::Vtg);
    }

    #[test]
    fn test_parse_gga_hdop() {
        let parsed = parse_sentence(GGA_GOOD).unwrap();
        assert_eq!(parsed, Sentence::Gga(GgaData { hdop: Some(1.2) }));
    }

    #[test]
    fn test_parse_unused_sentence_type() {
        let parsed = parse_sentence(
            "$GPGSV,3,1,11,10,63,137,17,07,61,098,15,05,59,290,20,08,54,157,30*70",
        )
        .unwrap();
        assert_eq!(parsed, Sentence::Other);
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mangled = RMC_FIX.replace("*49", "*00");
        assert_eq!(parse_sentence(&mangled), None);
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(parse_sentence("not an nmea line"), None);
        assert_eq!(parse_sentence("$GPRMC,missing star"), None);
        assert_eq!(parse_sentence(""), None);
        // Valid checksum but unparsable speed field
        assert_eq!(
            parse_sentence("$GPRMC,120000.00,A,6408.9000,N,02156.5000,W,bad,84.4,170825,,,A*31"),
            None
        );
    }

    #[test]
    fn test_multibyte_line_with_matching_checksum_rejected() {
        // "€a" is the byte sequence E2 82 AC 61, which XORs to 0xAD, so
        // the checksum gate passes; the talker slice has to reject it
        // rather than land inside a character.
        assert_eq!(parse_sentence("$€a*AD"), None);
    }

    #[test]
    fn test_multibyte_field_content_rejected() {
        assert_eq!(parse_coord("€€5.0", "N"), None);
        assert_eq!(parse_fix_time("€€", "120000.00"), None);
        assert_eq!(parse_fix_time("170825", "€€"), None);
    }

    #[test]
    fn test_hdop_limit_per_tier() {
        assert_eq!(hdop_limit(AccuracyTier::Best), Some(2.0));
        assert_eq!(hdop_limit(AccuracyTier::High), Some(5.0));
        assert_eq!(hdop_limit(AccuracyTier::Balanced), Some(10.0));
        assert_eq!(hdop_limit(AccuracyTier::Low), None);
    }

    #[test]
    fn test_distance_m() {
        // 0.0005 degrees of latitude is about 55.6 m regardless of longitude
        let d = distance_m(64.0, -22.0, 64.0005, -22.0);
        assert!((d - 55.6).abs() < 0.5, "got {d}");

        let zero = distance_m(64.0, -22.0, 64.0, -22.0);
        assert!(zero < 1e-9);
    }

    fn feed(reader: &mut NmeaReader, tx: &mpsc::Sender<PositionSample>, line: &str) -> bool {
        reader.line_buffer.extend_from_slice(line.as_bytes());
        reader.line_buffer.extend_from_slice(b"\r\n");
        reader.drain_lines(tx)
    }

    #[tokio::test]
    async fn test_reader_delivers_fix() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut reader = NmeaReader::new(AccuracyTier::Low, 0.0, None);

        assert!(feed(&mut reader, &tx, RMC_FIX));

        let sample = rx.try_recv().unwrap();
        assert!((sample.speed_mps - 10.0 * KNOTS_TO_MPS).abs() < 1e-9);
        assert_eq!(sample.fix_time_ms, Some(1_755_432_000_000));
    }

    #[tokio::test]
    async fn test_reader_handles_split_lines() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut reader = NmeaReader::new(AccuracyTier::Low, 0.0, None);

        let (head, tail) = RMC_FIX.split_at(20);
        reader.line_buffer.extend_from_slice(head.as_bytes());
        assert!(reader.drain_lines(&tx));
        assert!(rx.try_recv().is_err(), "no complete line yet");

        reader.line_buffer.extend_from_slice(tail.as_bytes());
        reader.line_buffer.extend_from_slice(b"\r\n");
        assert!(reader.drain_lines(&tx));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_reader_hdop_gate() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut reader = NmeaReader::new(AccuracyTier::Best, 0.0, None);

        // HDOP 9.9 exceeds the Best tier bound of 2.0
        assert!(feed(&mut reader, &tx, GGA_POOR));
        assert!(feed(&mut reader, &tx, RMC_FIX));
        assert!(rx.try_recv().is_err(), "poor fix must not be delivered");

        // A clean GGA reopens the gate
        assert!(feed(&mut reader, &tx, GGA_GOOD));
        assert!(feed(&mut reader, &tx, RMC_FIX));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_reader_low_tier_ignores_hdop() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut reader = NmeaReader::new(AccuracyTier::Low, 0.0, None);

        assert!(feed(&mut reader, &tx, GGA_POOR));
        assert!(feed(&mut reader, &tx, RMC_FIX));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_reader_min_distance_filter() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut reader = NmeaReader::new(AccuracyTier::Low, 5.0, None);

        assert!(feed(&mut reader, &tx, RMC_FIX));
        assert!(rx.try_recv().is_ok(), "first fix always delivered");

        // 0.0005 arcminutes north is under a meter away
        assert!(feed(
            &mut reader,
            &tx,
            "$GPRMC,120001.00,A,6408.9005,N,02156.5000,W,10.0,84.4,170825,,,A*4D"
        ));
        assert!(rx.try_recv().is_err(), "near-stationary fix filtered");
    }

    #[tokio::test]
    async fn test_reader_invalid_line_does_not_stop_stream() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut reader = NmeaReader::new(AccuracyTier::Low, 0.0, None);

        assert!(feed(&mut reader, &tx, "garbage with no checksum"));
        assert!(feed(&mut reader, &tx, RMC_FIX));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_reader_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut reader = NmeaReader::new(AccuracyTier::Low, 0.0, None);

        assert!(!feed(&mut reader, &tx, RMC_FIX));
    }

    #[tokio::test]
    async fn test_reader_clears_oversized_buffer() {
        let (tx, _rx) = mpsc::channel(4);
        let mut reader = NmeaReader::new(AccuracyTier::Low, 0.0, None);

        reader.line_buffer.extend_from_slice(&[b'x'; MAX_SENTENCE_LEN + 1]);
        assert!(reader.drain_lines(&tx));
        assert!(reader.line_buffer.is_empty());
    }
}
