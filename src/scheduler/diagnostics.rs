use std::collections::HashMap;
use std::fmt::{self, Display, Formatter, Write};
use std::time::{Duration, Instant};

use crate::registry::Graph;

/// When a producer started and how long it took.
#[derive(Debug, Clone)]
pub struct Execution {
    pub start: Instant,
    pub duration: Duration,
}

/// Per-producer timings of a run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Producers invoked during the run, keyed by name.
    pub execution_times: HashMap<String, Execution>,
}

impl Diagnostics {
    /// Producers ordered from slowest to fastest.
    pub fn slowest(&self) -> Vec<(&str, Duration)> {
        let mut times: Vec<_> = self
            .execution_times
            .iter()
            .map(|(name, exec)| (name.as_str(), exec.duration))
            .collect();
        times.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        times
    }

    /// Renders the producer graph as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Not invoked in this run
    pub fn render_mermaid(&self, graph: &Graph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (min_time, max_time) = self
            .execution_times
            .values()
            .map(|exec| exec.duration.as_secs_f64())
            .fold(None, |acc: Option<(f64, f64)>, secs| match acc {
                Some((min, max)) => Some((min.min(secs), max.max(secs))),
                None => Some((secs, secs)),
            })
            .unwrap_or((0.0, 0.0));

        let span = match max_time - min_time {
            span if span.abs() < f64::EPSILON => 1.0,
            span => span,
        };

        for index in graph.indices() {
            let producer = &graph.node(index).producer;
            let name = producer.name().replace('"', "\\\"");

            let (label, color) = match self.execution_times.get(producer.name()) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / span;
                    (format!("{:.2?}", exec.duration), gradient(t))
                }
                None => ("skipped".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for (source, target) in graph.edges() {
            let _ = writeln!(f, "    {} --> {}", source.index(), target.index());
        }

        f
    }
}

/// 0.0 (green) -> 0.5 (yellow) -> 1.0 (red)
fn gradient(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };
    format!("#{r:02X}{g:02X}{b:02X}")
}

/// Slowest first, each with its start offset from the first producer.
impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let first = self.execution_times.values().map(|exec| exec.start).min();

        let mut rows: Vec<_> = self.execution_times.iter().collect();
        rows.sort_by(|a, b| b.1.duration.cmp(&a.1.duration).then_with(|| a.0.cmp(b.0)));

        for (name, exec) in rows {
            let offset = first
                .map(|first| exec.start.duration_since(first))
                .unwrap_or_default();
            writeln!(f, "{:>10.2?}  +{:<10.2?} {name}", exec.duration, offset)?;
        }
        Ok(())
    }
}
