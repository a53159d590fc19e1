use std::sync::{Mutex, mpsc};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Output(String),
    Progress(u8),
    InProgress(bool),
}

pub trait BuildSink: Send + Sync {
    fn emit(&self, ev: BuildEvent);

    fn output(&self, line: String) {
        self.emit(BuildEvent::Output(line));
    }
}

/// Receiving ends of the three event streams.
pub struct BuildStreams {
    pub output: mpsc::Receiver<String>,
    pub progress: mpsc::Receiver<u8>,
    pub in_progress: mpsc::Receiver<bool>,
}

/// Fans events out to one channel per kind so subscribers can consume them independently.
#[derive(Clone)]
pub struct ChannelSink {
    output: mpsc::Sender<String>,
    progress: mpsc::Sender<u8>,
    in_progress: mpsc::Sender<bool>,
}

impl ChannelSink {
    pub fn new() -> (Self, BuildStreams) {
        let (output_tx, output) = mpsc::channel();
        let (progress_tx, progress) = mpsc::channel();
        let (in_progress_tx, in_progress) = mpsc::channel();
        (
            Self {
                output: output_tx,
                progress: progress_tx,
                in_progress: in_progress_tx,
            },
            BuildStreams {
                output,
                progress,
                in_progress,
            },
        )
    }
}

impl BuildSink for ChannelSink {
    fn emit(&self, ev: BuildEvent) {
        // A dropped receiver just means nobody is listening to that stream.
        match ev {
            BuildEvent::Output(line) => {
                let _ = self.output.send(line);
            }
            BuildEvent::Progress(p) => {
                let _ = self.progress.send(p);
            }
            BuildEvent::InProgress(b) => {
                let _ = self.in_progress.send(b);
            }
        }
    }
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    lines: usize,
}

impl BuildSink for StdoutSink {
    fn emit(&self, ev: BuildEvent) {
        match ev {
            BuildEvent::Output(line) => {
                if let Ok(mut s) = self.state.lock() {
                    s.lines = s.lines.saturating_add(1);
                }
                println!("{line}");
            }
            BuildEvent::Progress(p) => println!("[{p:>3}%]"),
            BuildEvent::InProgress(true) => {
                if let Ok(mut s) = self.state.lock() {
                    *s = StdoutSinkState {
                        started_at: Some(Instant::now()),
                        lines: 0,
                    };
                }
            }
            BuildEvent::InProgress(false) => {
                if let Ok(s) = self.state.lock() {
                    let secs = s.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0);
                    println!(
                        "build finished in {} ({} output lines)",
                        format_elapsed_hms(secs),
                        s.lines
                    );
                }
            }
        }
    }
}

/// Records every event in order; handy for embedders and tests.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<BuildEvent>>,
}

impl CollectSink {
    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn output_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::Output(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn progress_values(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

impl BuildSink for CollectSink {
    fn emit(&self, ev: BuildEvent) {
        if let Ok(mut e) = self.events.lock() {
            e.push(ev);
        }
    }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_splits_streams() {
        let (sink, streams) = ChannelSink::new();
        sink.emit(BuildEvent::InProgress(true));
        sink.output("hello".into());
        sink.emit(BuildEvent::Progress(20));
        sink.emit(BuildEvent::InProgress(false));
        drop(sink);

        assert_eq!(streams.output.iter().collect::<Vec<_>>(), vec!["hello"]);
        assert_eq!(streams.progress.iter().collect::<Vec<_>>(), vec![20]);
        assert_eq!(
            streams.in_progress.iter().collect::<Vec<_>>(),
            vec![true, false]
        );
    }

    #[test]
    fn collect_sink_keeps_order() {
        let sink = CollectSink::default();
        sink.output("a".into());
        sink.emit(BuildEvent::Progress(35));
        sink.output("b".into());
        assert_eq!(sink.output_lines(), vec!["a", "b"]);
        assert_eq!(sink.progress_values(), vec![35]);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed_hms(3_725), "01:02:05");
    }
}
