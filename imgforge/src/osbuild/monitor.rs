//! Reader for the line-delimited JSON progress stream of the build engine.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead};

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

/// Origin of records written by the engine itself rather than a stage.
pub const MONITOR_ORIGIN: &str = "osbuild.monitor";

/// Contexts remembered for id-only records; the oldest is dropped first.
const MAX_CONTEXTS: usize = 256;

/// Byte that json-seq framing puts in front of each record.
const RECORD_SEPARATOR: u8 = 0x1e;

#[derive(Debug, Clone, Default, Deserialize)]
struct StageContext {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PipelineContext {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    stage: StageContext,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawContext {
    #[serde(default)]
    origin: String,
    #[serde(default)]
    pipeline: PipelineContext,
    #[serde(default)]
    id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawProgress {
    #[serde(default)]
    name: String,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    done: u64,
    #[serde(default)]
    progress: Option<Box<RawProgress>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    context: Option<RawContext>,
    #[serde(default)]
    progress: Option<RawProgress>,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    result: Option<BuildResult>,
}

/// One level of the nested progress record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
    pub message: String,
    pub sub_progress: Option<Box<Progress>>,
}

impl Progress {
    /// Nesting depth, counting this level.
    pub fn depth(&self) -> usize {
        1 + self.sub_progress.as_ref().map_or(0, |p| p.depth())
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub origin: String,
    pub pipeline: String,
    pub pipeline_id: String,
    pub stage: String,
    pub stage_id: String,
}

/// A single decoded progress record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    /// Human-facing message from the engine.
    pub message: String,
    /// Output of a stage or an unparseable line.
    pub trace: String,
    pub progress: Option<Progress>,
    /// Seconds since the epoch.
    pub timestamp: f64,
    /// Seconds the finished step took, when reported.
    pub duration: Option<f64>,
    pub context: Context,
}

impl Status {
    /// Name of the pipeline the record belongs to, empty when unknown.
    pub fn pipeline(&self) -> &str {
        &self.context.pipeline
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ValidationError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<String>,
}

/// Final verdict the engine writes once the build is over.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BuildResult {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub errors: Vec<ValidationError>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn convert_progress(raw: RawProgress, ctx: &Context, top: bool) -> Progress {
    let message = match (top, ctx.pipeline.is_empty(), ctx.stage.is_empty()) {
        (true, false, _) => format!("Pipeline {}", ctx.pipeline),
        (false, _, false) => format!("Stage {}", ctx.stage),
        _ => String::new(),
    };
    Progress {
        done: raw.done,
        total: raw.total,
        message,
        sub_progress: raw
            .progress
            .map(|sub| Box::new(convert_progress(*sub, ctx, false))),
    }
}

/// Streams [`Status`] values out of a reader, one line at a time.
///
/// Engine records often carry only a context id once the full context was
/// sent; the scanner remembers the most recent contexts and fills those in.
/// Lines that are not JSON, or not UTF-8, come back as traces.
pub struct StatusScanner<R> {
    reader: R,
    line: Vec<u8>,
    contexts: HashMap<String, Context>,
    context_order: VecDeque<String>,
    result: Option<BuildResult>,
}

impl<R: BufRead> StatusScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            contexts: HashMap::new(),
            context_order: VecDeque::new(),
            result: None,
        }
    }

    /// Next record, or `None` at the end of the stream.
    pub fn next_status(&mut self) -> io::Result<Option<Status>> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line)? == 0 {
                return Ok(None);
            }
            let mut bytes = self.line.as_slice();
            while let [rest @ .., b'\n' | b'\r'] = bytes {
                bytes = rest;
            }
            while let [RECORD_SEPARATOR, rest @ ..] = bytes {
                bytes = rest;
            }
            if bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let raw: RawStatus = match serde_json::from_slice(bytes) {
                Ok(raw) => raw,
                Err(err) => {
                    trace!(%err, "unparseable monitor line");
                    return Ok(Some(Status {
                        trace: String::from_utf8_lossy(bytes).into_owned(),
                        ..Default::default()
                    }));
                }
            };
            return Ok(Some(self.decode(raw)));
        }
    }

    fn decode(&mut self, raw: RawStatus) -> Status {
        let context = match raw.context {
            Some(ctx) if ctx.origin.is_empty() && !ctx.id.is_empty() => {
                self.contexts.get(&ctx.id).cloned().unwrap_or_default()
            }
            Some(ctx) => {
                let context = Context {
                    origin: ctx.origin,
                    pipeline: ctx.pipeline.name,
                    pipeline_id: ctx.pipeline.id,
                    stage: ctx.pipeline.stage.name,
                    stage_id: ctx.pipeline.stage.id,
                };
                if !ctx.id.is_empty() {
                    self.remember(ctx.id, context.clone());
                }
                context
            }
            None => Context::default(),
        };
        if raw.result.is_some() {
            self.result = raw.result;
        }
        let (message, trace) = if context.origin == MONITOR_ORIGIN {
            (raw.message, String::new())
        } else {
            (String::new(), raw.message)
        };
        Status {
            message,
            trace,
            progress: Some(convert_progress(
                raw.progress.unwrap_or_default(),
                &context,
                true,
            )),
            timestamp: raw.timestamp,
            duration: raw.duration,
            context,
        }
    }

    fn remember(&mut self, id: String, context: Context) {
        if self.contexts.insert(id.clone(), context).is_none() {
            self.context_order.push_back(id);
        }
        while self.context_order.len() > MAX_CONTEXTS {
            if let Some(oldest) = self.context_order.pop_front() {
                self.contexts.remove(&oldest);
            }
        }
    }

    /// The build verdict, once the engine has reported one.
    pub fn result(&self) -> Option<&BuildResult> {
        self.result.as_ref()
    }
}

impl<R: BufRead> Iterator for StatusScanner<R> {
    type Item = io::Result<Status>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_status().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scan(input: &str) -> Vec<Status> {
        StatusScanner::new(Cursor::new(input.to_string()))
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn nested_progress_gets_pipeline_and_stage_messages() {
        let line = r#"{"message": "Starting module org.osbuild.rpm",
            "context": {"origin": "osbuild.monitor", "id": "ctx1",
                "pipeline": {"name": "build", "id": "p1",
                    "stage": {"name": "org.osbuild.rpm", "id": "s1"}}},
            "timestamp": 1731600115.14839,
            "progress": {"name": "pipelines", "total": 4, "done": 1,
                "progress": {"name": "stages", "total": 8, "done": 2,
                    "progress": {"name": "packages", "total": 16, "done": 4}}}}"#
            .replace('\n', " ");
        let statuses = scan(&line);
        assert_eq!(statuses.len(), 1);
        let st = &statuses[0];
        assert_eq!(st.message, "Starting module org.osbuild.rpm");
        assert!(st.trace.is_empty());
        assert_eq!(st.pipeline(), "build");
        assert_eq!(st.timestamp, 1731600115.14839);
        let progress = st.progress.as_ref().unwrap();
        assert_eq!(progress.message, "Pipeline build");
        assert_eq!(progress.depth(), 3);
        let sub = progress.sub_progress.as_ref().unwrap();
        assert_eq!((sub.done, sub.total), (2, 8));
        assert_eq!(sub.message, "Stage org.osbuild.rpm");
        assert_eq!(sub.sub_progress.as_ref().unwrap().total, 16);
    }

    #[test]
    fn stage_output_is_a_trace_and_contexts_are_cached() {
        let input = concat!(
            r#"{"message": "Downloaded kpartx", "context": {"origin": "org.osbuild", "id": "c1", "pipeline": {"name": "source org.osbuild.curl"}}, "progress": {"total": 4, "done": 0}, "timestamp": 1.5}"#,
            "\n",
            r#"{"message": "Downloaded langpacks", "context": {"id": "c1"}, "progress": {"total": 4, "done": 0}, "timestamp": 2.5}"#,
            "\n"
        );
        let statuses = scan(input);
        assert_eq!(statuses.len(), 2);
        for st in &statuses {
            assert!(st.message.is_empty());
            assert_eq!(st.pipeline(), "source org.osbuild.curl");
        }
        assert_eq!(statuses[1].trace, "Downloaded langpacks");
        assert_eq!(
            statuses[1].progress.as_ref().unwrap().message,
            "Pipeline source org.osbuild.curl"
        );
    }

    #[test]
    fn empty_record_and_garbage() {
        let statuses = scan("{}\nnot json at all\n\n");
        assert_eq!(statuses.len(), 2);
        assert_eq!(
            statuses[0],
            Status {
                progress: Some(Progress::default()),
                ..Default::default()
            }
        );
        assert_eq!(statuses[1].trace, "not json at all");
        assert!(statuses[1].progress.is_none());
    }

    #[test]
    fn invalid_utf8_becomes_a_trace() {
        let mut input = br#"{"message": "ok"}"#.to_vec();
        input.extend_from_slice(b"\ngarbage \xff\xfe bytes\n");
        input.extend_from_slice(br#"{"message": "after"}"#);
        let statuses = StatusScanner::new(Cursor::new(input))
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0].trace, "ok");
        assert_eq!(statuses[1].trace, "garbage \u{fffd}\u{fffd} bytes");
        assert!(statuses[1].progress.is_none());
        assert_eq!(statuses[2].trace, "after");
    }

    #[test]
    fn record_separators_are_stripped() {
        let statuses = scan("\u{1e}{\"message\": \"framed\"}\r\n");
        assert_eq!(statuses[0].trace, "framed");
    }

    #[test]
    fn context_cache_is_bounded() {
        let mut input = String::new();
        for i in 0..MAX_CONTEXTS + 10 {
            input.push_str(&format!(
                r#"{{"context": {{"origin": "org.osbuild", "id": "c{i}", "pipeline": {{"name": "p{i}"}}}}}}"#
            ));
            input.push('\n');
        }
        input.push_str(r#"{"context": {"id": "c0"}}"#);
        input.push('\n');
        let last = format!(r#"{{"context": {{"id": "c{}"}}}}"#, MAX_CONTEXTS + 9);
        input.push_str(&last);

        let mut scanner = StatusScanner::new(Cursor::new(input));
        let statuses: Vec<_> = scanner.by_ref().collect::<io::Result<_>>().unwrap();
        assert_eq!(scanner.contexts.len(), MAX_CONTEXTS);
        assert_eq!(scanner.context_order.len(), MAX_CONTEXTS);
        let n = statuses.len();
        assert_eq!(statuses[n - 2].pipeline(), "");
        assert_eq!(statuses[n - 1].pipeline(), format!("p{}", MAX_CONTEXTS + 9));
    }

    #[test]
    fn very_long_line_is_kept_whole() {
        let long = "1".repeat(4 * 1024 * 1024);
        let statuses = scan(&format!(r#"{{"message": "{long}"}}"#));
        assert_eq!(statuses[0].trace.len(), long.len());
    }

    #[test]
    fn result_is_remembered() {
        let input = r#"{"result": {"type": "https://osbuild.org/validation-error", "success": false, "title": "JSON Schema validation failed", "errors": [{"message": "bad", "path": ["pipelines", "[0]"]}]}}"#;
        let mut scanner = StatusScanner::new(Cursor::new(input));
        assert!(scanner.next_status().unwrap().is_some());
        assert!(scanner.next_status().unwrap().is_none());
        let result = scanner.result().unwrap();
        assert!(!result.success);
        assert_eq!(result.errors[0].path, ["pipelines", "[0]"]);
    }
}
