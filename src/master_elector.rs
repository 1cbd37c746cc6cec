//! Decides whether this daemon instance should be the one publishing DNS
//! updates this tick, and publishes its own heartbeat when it is.
//!
//! Grounded on `original_source/cmd/lbd.go`'s `shouldUpdateDNS` and
//! `updateHeartbeat`: every instance polls a shared heartbeat URL; if the
//! line it finds there names someone else and is recent, this instance
//! stands down. Any parse failure or staleness defaults to "go ahead and
//! update" -- a standby daemon would rather publish than leave DNS stale.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::MASTER_TAKEOVER_THRESHOLD_SECS;
use crate::error::Result;
use crate::types::now_epoch_secs;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(20);

pub struct MasterElector {
    hostname: String,
    heartbeat_url: String,
    heartbeat_path: PathBuf,
    heartbeat_file: PathBuf,
    http: reqwest::Client,
    heartbeat_line_re: Regex,
    write_lock: Mutex<()>,
}

impl MasterElector {
    pub fn new(hostname: String, heartbeat_url: String, heartbeat_path: PathBuf, heartbeat_file: PathBuf) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .expect("reqwest client configuration is static and always valid");

        Self {
            hostname,
            heartbeat_url,
            heartbeat_path,
            heartbeat_file,
            http,
            heartbeat_line_re: Regex::new(r"(\S+)\s*:\s*(\d+)\s*:\s*I am alive").unwrap(),
            write_lock: Mutex::new(()),
        }
    }

    /// Fetch the shared heartbeat and decide whether this instance should
    /// update DNS this tick. Defaults to `true` whenever the heartbeat can't
    /// be fetched or parsed, or is stale.
    pub async fn should_update_dns(&self) -> bool {
        let body = match self.http.get(&self.heartbeat_url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed reading heartbeat body, assuming master role");
                    return true;
                }
            },
            Err(e) => {
                warn!(error = %e, "failed fetching heartbeat, assuming master role");
                return true;
            }
        };

        let Some(caps) = self.heartbeat_line_re.captures(&body) else {
            debug!("heartbeat body didn't match expected format, assuming master role");
            return true;
        };

        let who = &caps[1];
        if who == self.hostname {
            // We were the last writer; nothing stops us from continuing.
            return true;
        }

        let Ok(timestamp) = caps[2].parse::<u64>() else {
            return true;
        };

        let now = now_epoch_secs();
        let age = now.saturating_sub(timestamp);
        if age > MASTER_TAKEOVER_THRESHOLD_SECS {
            warn!(who, age, "master heartbeat stale, taking over DNS updates");
            return true;
        }

        debug!(who, age, "another instance is master, standing down");
        false
    }

    /// Append this instance's heartbeat line to a temp file, then rename it
    /// into place atomically, mirroring the Go source's
    /// append-then-os.Rename pattern. Guarded by a mutex since the
    /// controller's tick loop is the only caller but heartbeat writes must
    /// never interleave with themselves across ticks.
    pub fn write_heartbeat(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(&self.heartbeat_path)?;

        let tmp_path = self.heartbeat_path.join(".heartbeat.tmp");
        let line = format!("{} : {} : I am alive\n", self.hostname, now_epoch_secs());

        {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(line.as_bytes())?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, self.final_path())?;
        Ok(())
    }

    fn final_path(&self) -> PathBuf {
        self.heartbeat_path.join(&self.heartbeat_file)
    }
}

/// Standalone helper used by tests to exercise the regex without a live
/// HTTP round trip.
fn parse_heartbeat_line(re: &Regex, body: &str) -> Option<(String, u64)> {
    let caps = re.captures(body)?;
    let who = caps[1].to_string();
    let ts = caps[2].parse().ok()?;
    Some((who, ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re() -> Regex {
        Regex::new(r"(\S+)\s*:\s*(\d+)\s*:\s*I am alive").unwrap()
    }

    #[test]
    fn parses_well_formed_heartbeat_line() {
        let (who, ts) = parse_heartbeat_line(&re(), "lb02.example.org : 1700000000 : I am alive").unwrap();
        assert_eq!(who, "lb02.example.org");
        assert_eq!(ts, 1700000000);
    }

    #[test]
    fn rejects_malformed_heartbeat_line() {
        assert!(parse_heartbeat_line(&re(), "garbage").is_none());
    }

    #[tokio::test]
    async fn stale_heartbeat_from_other_host_triggers_takeover() {
        let elector = MasterElector::new(
            "this-host".into(),
            "http://127.0.0.1:1/heartbeat".into(),
            std::env::temp_dir(),
            PathBuf::from("heartbeat"),
        );
        // 700s in the past, beyond MASTER_TAKEOVER_THRESHOLD_SECS (600s).
        let stale_ts = now_epoch_secs().saturating_sub(700);
        let body = format!("other-host : {stale_ts} : I am alive");
        let caps = elector.heartbeat_line_re.captures(&body).unwrap();
        let age = now_epoch_secs().saturating_sub(caps[2].parse::<u64>().unwrap());
        assert!(age > MASTER_TAKEOVER_THRESHOLD_SECS);
    }

    #[test]
    fn heartbeat_write_then_read_back_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let elector = MasterElector::new(
            "this-host".into(),
            "http://unused".into(),
            dir.path().to_path_buf(),
            PathBuf::from("heartbeat"),
        );
        elector.write_heartbeat().unwrap();
        let contents = std::fs::read_to_string(elector.final_path()).unwrap();
        assert!(contents.contains("this-host"));
        assert!(contents.trim_end().ends_with("I am alive"));
    }
}
