//! Scoped capture of log output for one input file.
//!
//! [`CaptureLayer`] is installed once in the subscriber stack. Calling
//! [`LogCapture::start`] with a span registers a buffer that receives every
//! event emitted inside that span, including events from blocking threads
//! that entered it. The buffer is detached when the returned
//! [`CaptureGuard`] is finished or dropped, so a failing or panicking file
//! never leaves a capture behind.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Span, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

type Buffers = Arc<Mutex<HashMap<u64, String>>>;

/// Registry of active capture buffers, keyed by span id.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffers: Buffers,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer feeding this capture. Add it to the subscriber exactly once.
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer {
            buffers: self.buffers.clone(),
        }
    }

    /// Start capturing events emitted inside `span`.
    ///
    /// A disabled span has no id and captures nothing.
    pub fn start(&self, span: &Span) -> CaptureGuard {
        let id = span.id().map(|id| id.into_u64());
        if let (Some(id), Ok(mut buffers)) = (id, self.buffers.lock()) {
            buffers.insert(id, String::new());
        }
        CaptureGuard {
            buffers: self.buffers.clone(),
            id,
        }
    }

    /// Number of captures currently attached.
    pub fn active(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }
}

/// Keeps a capture attached until finished or dropped.
#[derive(Debug)]
#[must_use = "dropping the guard ends the capture"]
pub struct CaptureGuard {
    buffers: Buffers,
    id: Option<u64>,
}

impl CaptureGuard {
    /// Detach the capture and return everything it recorded.
    pub fn finish(self) -> String {
        self.detach()
    }

    fn detach(&self) -> String {
        self.id
            .and_then(|id| self.buffers.lock().ok()?.remove(&id))
            .unwrap_or_default()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.detach();
    }
}

/// `tracing_subscriber` layer writing formatted events into the buffers of
/// the enclosing captured span.
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    buffers: Buffers,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Ok(mut buffers) = self.buffers.lock() else {
            return;
        };
        if buffers.is_empty() {
            return;
        }
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };

        for span in scope {
            if let Some(buffer) = buffers.get_mut(&span.id().into_u64()) {
                write_event(buffer, event);
                return;
            }
        }
    }
}

fn write_event(buffer: &mut String, event: &Event<'_>) {
    let metadata = event.metadata();
    let mut visitor = FieldVisitor::default();
    event.record(&mut visitor);

    let _ = writeln!(
        buffer,
        "{} {:>5} {}: {}{}",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        metadata.level(),
        metadata.target(),
        visitor.message,
        visitor.fields
    );
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: String,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{info, info_span, warn};
    use tracing_subscriber::prelude::*;

    fn subscriber(capture: &LogCapture) -> impl Subscriber + Send + Sync {
        tracing_subscriber::registry().with(capture.layer())
    }

    #[test]
    fn test_captures_events_inside_span() {
        let capture = LogCapture::new();
        let _default = tracing::subscriber::set_default(subscriber(&capture));

        let span = info_span!("process_file", file = "a.nc");
        let guard = capture.start(&span);
        span.in_scope(|| {
            info!(tiles = 4, "Starting tiled inference");
            warn!("Input has gaps");
        });
        info!("Outside of the file span");

        let text = guard.finish();
        assert!(text.contains("Starting tiled inference tiles=4"));
        assert!(text.contains("WARN"));
        assert!(text.contains("Input has gaps"));
        assert!(!text.contains("Outside"));
        assert_eq!(capture.active(), 0);
    }

    #[test]
    fn test_captures_nested_spans() {
        let capture = LogCapture::new();
        let _default = tracing::subscriber::set_default(subscriber(&capture));

        let span = info_span!("process_file");
        let guard = capture.start(&span);
        span.in_scope(|| {
            info_span!("tile", i = 0).in_scope(|| info!("Processed tile"));
        });
        assert!(guard.finish().contains("Processed tile"));
    }

    #[test]
    fn test_dropping_guard_detaches() {
        let capture = LogCapture::new();
        let _default = tracing::subscriber::set_default(subscriber(&capture));

        let span = info_span!("process_file");
        {
            let _guard = capture.start(&span);
            assert_eq!(capture.active(), 1);
        }
        assert_eq!(capture.active(), 0);
        span.in_scope(|| info!("not recorded"));
        assert_eq!(capture.active(), 0);
    }

    #[test]
    fn test_captures_are_separate() {
        let capture = LogCapture::new();
        let _default = tracing::subscriber::set_default(subscriber(&capture));

        let first = info_span!("process_file", file = "a");
        let second = info_span!("process_file", file = "b");
        let first_guard = capture.start(&first);
        let second_guard = capture.start(&second);
        first.in_scope(|| info!("first file"));
        second.in_scope(|| info!("second file"));

        let first_text = first_guard.finish();
        let second_text = second_guard.finish();
        assert!(first_text.contains("first file") && !first_text.contains("second file"));
        assert!(second_text.contains("second file") && !second_text.contains("first file"));
    }
}
