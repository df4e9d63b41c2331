use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rpc_observe::logging::Logger;

/// Logger that keeps every message in memory, tagged with its level
#[derive(Debug, Default)]
pub struct CaptureLogger(Mutex<Vec<(&'static str, String)>>);

#[allow(unused)]
impl CaptureLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// all lines logged so far, oldest first
    pub fn lines(&self) -> Vec<(&'static str, String)> {
        self.0.lock().unwrap().clone()
    }

    /// lines at the given level that start with `prefix`
    pub fn find(&self, level: &str, prefix: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(l, msg)| *l == level && msg.starts_with(prefix))
            .map(|(_, msg)| msg)
            .collect()
    }

    /// the single line at the given level that starts with `prefix`
    pub fn one(&self, level: &str, prefix: &str) -> String {
        let mut found = self.find(level, prefix);
        assert_eq!(
            found.len(),
            1,
            "expected one {level} line starting with {prefix:?}, got {:#?}",
            self.lines()
        );
        found.remove(0)
    }

    /// wait until exactly one line at the given level starts with `prefix`
    pub async fn wait_for(&self, level: &str, prefix: &str) -> String {
        loop {
            if let [line] = &self.find(level, prefix)[..] {
                return line.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.find("ERROR", "")
    }
}

impl Logger for CaptureLogger {
    fn info(&self, message: &str) {
        self.0.lock().unwrap().push(("INFO", message.to_owned()));
    }

    fn error(&self, message: &str) {
        self.0.lock().unwrap().push(("ERROR", message.to_owned()));
    }
}
