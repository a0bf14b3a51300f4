// 🧾 Slip Reader - Find the transfer time printed on a payment slip
//
// Two layers:
// - TextRecognizer: the OCR engine (expensive, built once per process)
// - SlipTimeExtractor: image → Option<time of day>, never fails
//
// The OCR engine itself is a black box; CommandRecognizer pipes the image
// into an external program (tesseract by default) and reads text back.

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveTime;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Seconds an OCR process may run before it is killed
pub const DEFAULT_OCR_TIMEOUT_SECS: u64 = 30;

/// Cap on OCR text read back (a slip is a few hundred bytes of text)
const MAX_OCR_OUTPUT_BYTES: u64 = 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

// ============================================================================
// TRAITS
// ============================================================================

/// OCR engine: image bytes → recognized text lines
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &[u8]) -> Result<Vec<String>>;

    /// Engine name for logs
    fn name(&self) -> &str {
        "ocr"
    }
}

/// Slip time extractor: failure or no match is `None`, never an error
pub trait SlipTimeExtractor: Send + Sync {
    fn extract_time(&self, image: &[u8]) -> Option<NaiveTime>;
}

// ============================================================================
// OCR-BACKED EXTRACTOR
// ============================================================================

/// Extractor that runs a shared recognizer and scans its text
pub struct OcrSlipReader {
    recognizer: Arc<dyn TextRecognizer>,
}

impl OcrSlipReader {
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        OcrSlipReader { recognizer }
    }
}

impl SlipTimeExtractor for OcrSlipReader {
    fn extract_time(&self, image: &[u8]) -> Option<NaiveTime> {
        if image.is_empty() {
            return None;
        }

        let lines = match self.recognizer.recognize(image) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(engine = self.recognizer.name(), error = %e, "slip recognition failed");
                return None;
            }
        };

        let found = lines.iter().find_map(|line| find_time_in_text(line));
        debug!(engine = self.recognizer.name(), lines = lines.len(), ?found, "slip scanned");
        found
    }
}

/// Extractor used when no OCR engine is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSlipReader;

impl SlipTimeExtractor for NoSlipReader {
    fn extract_time(&self, _image: &[u8]) -> Option<NaiveTime> {
        None
    }
}

// ============================================================================
// COMMAND RECOGNIZER
// ============================================================================

/// Runs an external OCR program: image on stdin, text on stdout.
///
/// The process is killed once `timeout` has passed.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandRecognizer {
    pub fn new(program: &str, args: &[String]) -> Self {
        CommandRecognizer {
            program: program.to_string(),
            args: args.to_vec(),
            timeout: Duration::from_secs(DEFAULT_OCR_TIMEOUT_SECS),
        }
    }

    /// `tesseract stdin stdout -l tha+eng`
    pub fn tesseract() -> Self {
        let args: Vec<String> = ["stdin", "stdout", "-l", "tha+eng"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self::new("tesseract", &args)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl TextRecognizer for CommandRecognizer {
    fn recognize(&self, image: &[u8]) -> Result<Vec<String>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start OCR command: {}", self.program))?;

        // Pipes are serviced on helper threads so a full pipe cannot stall
        // the deadline loop; killing the child closes them.
        let mut stdin = child.stdin.take().context("OCR command has no stdin")?;
        let image = image.to_vec();
        let writer = thread::spawn(move || stdin.write_all(&image));

        let stdout = child.stdout.take().context("OCR command has no stdout")?;
        let stdout_reader = thread::spawn(move || read_bounded(stdout));

        let stderr = child.stderr.take().context("OCR command has no stderr")?;
        let stderr_reader = thread::spawn(move || read_bounded(stderr));

        let status = match wait_with_deadline(&mut child, self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "OCR command {} timed out after {:?}",
                    self.program,
                    self.timeout
                );
            }
        };

        // A program that exits without reading all of stdin is judged by its status
        if let Ok(Err(e)) = writer.join() {
            debug!(engine = %self.program, error = %e, "OCR command closed stdin early");
        }

        let stdout = stdout_reader
            .join()
            .map_err(|_| anyhow!("OCR output reader panicked"))?
            .context("Failed to read OCR command output")?;
        let stderr = stderr_reader
            .join()
            .map_err(|_| anyhow!("OCR error reader panicked"))?
            .unwrap_or_default();

        if !status.success() {
            bail!(
                "OCR command exited with {}: {}",
                status,
                String::from_utf8_lossy(&stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    fn name(&self) -> &str {
        &self.program
    }
}

fn read_bounded<R: Read>(pipe: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.take(MAX_OCR_OUTPUT_BYTES).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Exit status, or `None` if the child is still running at the deadline
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("Failed to poll OCR command")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

// ============================================================================
// TIME FINDER
// ============================================================================

/// First plausible time of day in a line of slip text.
///
/// Matches `H:MM`, `HH:MM`, `HH:MM:SS` and `HH.MM`. Digit groups glued to
/// other digits or separators (amounts like 1,500.00, dates like 01/06/68,
/// account numbers) are ignored.
pub fn find_time_in_text(text: &str) -> Option<NaiveTime> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() || (i > 0 && is_glue(chars[i - 1])) {
            i += 1;
            continue;
        }

        if let Some(time) = match_time_at(&chars, i) {
            return Some(time);
        }

        // Skip the whole digit run so "1234:56" does not match at "34"
        let run = chars[i..].iter().take_while(|c| c.is_ascii_digit()).count();
        i += run.max(1);
    }

    None
}

/// Characters that make a digit group part of something larger
fn is_glue(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, ':' | '.' | ',' | '/' | '-')
}

fn take_digits(chars: &[char], start: usize, max: usize) -> (u32, usize) {
    let mut value = 0;
    let mut count = 0;
    while count < max {
        match chars.get(start + count).and_then(|c| c.to_digit(10)) {
            Some(d) => {
                value = value * 10 + d;
                count += 1;
            }
            None => break,
        }
    }
    (value, count)
}

/// Try to read a time starting at `start`
fn match_time_at(chars: &[char], start: usize) -> Option<NaiveTime> {
    let (hour, hour_len) = take_digits(chars, start, 2);
    if hour_len == 0 {
        return None;
    }

    let mut pos = start + hour_len;
    let separator = *chars.get(pos)?;
    if separator != ':' && separator != '.' {
        return None;
    }
    pos += 1;

    let (minute, minute_len) = take_digits(chars, pos, 2);
    if minute_len != 2 {
        return None;
    }
    pos += 2;

    let mut second = 0;
    if separator == ':' && chars.get(pos) == Some(&':') {
        let (s, s_len) = take_digits(chars, pos + 1, 2);
        if s_len == 2 {
            second = s;
            pos += 3;
        }
    }

    // Reject when the group keeps going ("12.345", "10:30:15:20", "1.500.00")
    if let Some(&next) = chars.get(pos) {
        if next.is_ascii_digit() {
            return None;
        }
        if matches!(next, ':' | '.' | ',')
            && chars.get(pos + 1).map_or(false, |c| c.is_ascii_digit())
        {
            return None;
        }
    }

    NaiveTime::from_hms_opt(hour, minute, second)
}

/// Hex SHA-256 of the slip image, stored in the log as evidence
pub fn slip_fingerprint(image: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FixedText(Vec<&'static str>);

    impl TextRecognizer for FixedText {
        fn recognize(&self, _image: &[u8]) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    struct Broken;

    impl TextRecognizer for Broken {
        fn recognize(&self, _image: &[u8]) -> Result<Vec<String>> {
            Err(anyhow!("engine crashed"))
        }
    }

    fn time(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_find_time_plain() {
        assert_eq!(find_time_in_text("เวลา 14:20 น."), Some(time(14, 20, 0)));
        assert_eq!(find_time_in_text("09:05:33"), Some(time(9, 5, 33)));
        assert_eq!(find_time_in_text("at 7:45"), Some(time(7, 45, 0)));
    }

    #[test]
    fn test_find_time_dot_form() {
        assert_eq!(find_time_in_text("1 มิ.ย. 68 - 14.20 น."), Some(time(14, 20, 0)));
    }

    #[test]
    fn test_find_time_skips_amounts_and_dates() {
        assert_eq!(find_time_in_text("จำนวน 1,500.00 บาท"), None);
        assert_eq!(find_time_in_text("01/06/68"), None);
        assert_eq!(find_time_in_text("Ref 123456789"), None);
        assert_eq!(find_time_in_text("amount 12.345"), None);
    }

    #[test]
    fn test_find_time_rejects_impossible_values() {
        assert_eq!(find_time_in_text("25:10"), None);
        assert_eq!(find_time_in_text("12:75"), None);
        assert_eq!(find_time_in_text("25:10 then 10:25"), Some(time(10, 25, 0)));
    }

    #[test]
    fn test_ocr_reader_scans_lines_in_order() {
        let reader = OcrSlipReader::new(Arc::new(FixedText(vec![
            "โอนเงินสำเร็จ",
            "จำนวน 500.00 บาท",
            "01 มิ.ย. 68 14:20",
            "สร้างเมื่อ 15:00",
        ])));

        assert_eq!(reader.extract_time(b"png"), Some(time(14, 20, 0)));
    }

    #[test]
    fn test_ocr_reader_swallows_engine_errors() {
        let reader = OcrSlipReader::new(Arc::new(Broken));
        assert_eq!(reader.extract_time(b"png"), None);
    }

    #[test]
    fn test_ocr_reader_empty_image() {
        let reader = OcrSlipReader::new(Arc::new(FixedText(vec!["14:20"])));
        assert_eq!(reader.extract_time(b""), None);
    }

    #[test]
    fn test_no_slip_reader() {
        assert_eq!(NoSlipReader.extract_time(b"png"), None);
    }

    #[test]
    fn test_missing_ocr_program_is_an_error() {
        let recognizer = CommandRecognizer::new("definitely-not-an-ocr-binary", &[]);
        assert!(recognizer.recognize(b"png").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_recognizer_reads_stdout() {
        let recognizer = CommandRecognizer::new("cat", &[]);
        let lines = recognizer.recognize("โอนเงิน\n14:20\n".as_bytes()).unwrap();
        assert_eq!(lines, vec!["โอนเงิน", "14:20"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_ocr_command_is_killed() {
        let recognizer = CommandRecognizer::new("sleep", &["30".to_string()])
            .with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let err = recognizer.recognize(b"png").unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_ocr_command_is_an_error() {
        let recognizer = CommandRecognizer::new("false", &[]);
        assert!(recognizer.recognize(b"png").is_err());
    }

    #[test]
    fn test_slip_fingerprint() {
        let hash = slip_fingerprint(b"slip");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, slip_fingerprint(b"slip"));
        assert_ne!(hash, slip_fingerprint(b"other slip"));
    }
}
