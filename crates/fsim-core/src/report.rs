//! XML-style run report.
//!
//! A minimal open/close tag tree with string-valued attributes. The schema is
//! stable for a given release but is not a compatibility surface; consumers
//! wanting machine-readable output should read the counters through the
//! library API instead.

use crate::stats::StreamStats;
use fsim_gc::GcStats;
use fsim_map::MappingStats;
use fsim_tsu::TsuStats;
use fsim_types::SimTime;
use std::fmt::Write as _;

/// Nested tag writer. Tags left open when [`finish`](Self::finish) runs are
/// closed automatically.
#[derive(Debug, Default)]
pub struct XmlWriter {
    out: String,
    stack: Vec<String>,
}

impl XmlWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            out: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"),
            stack: Vec::new(),
        }
    }

    pub fn open(&mut self, name: &str, attrs: &[(&str, String)]) {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        self.write_attrs(attrs);
        self.out.push_str(">\n");
        self.stack.push(name.to_owned());
    }

    /// Self-closing element.
    pub fn leaf(&mut self, name: &str, attrs: &[(&str, String)]) {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        self.write_attrs(attrs);
        self.out.push_str(" />\n");
    }

    pub fn close(&mut self) {
        if let Some(name) = self.stack.pop() {
            self.indent();
            let _ = write!(self.out, "</{name}>\n");
        }
    }

    #[must_use]
    pub fn finish(mut self) -> String {
        while !self.stack.is_empty() {
            self.close();
        }
        self.out
    }

    fn indent(&mut self) {
        for _ in 0..self.stack.len() {
            self.out.push_str("  ");
        }
    }

    fn write_attrs(&mut self, attrs: &[(&str, String)]) {
        for (key, value) in attrs {
            let _ = write!(self.out, " {key}=\"{}\"", escape(value));
        }
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Render every exported counter into the report tree.
#[must_use]
pub fn render_report(
    now: SimTime,
    streams: &[StreamStats],
    mapping: &[MappingStats],
    gc: GcStats,
    tsu: TsuStats,
) -> String {
    let mut w = XmlWriter::new();
    w.open("Results", &[("SimulatedTimeNs", now.0.to_string())]);

    w.open("Host", &[]);
    for (id, s) in streams.iter().enumerate() {
        w.leaf(
            "Stream",
            &[
                ("Id", id.to_string()),
                ("ReadsSubmitted", s.reads_submitted.to_string()),
                ("WritesSubmitted", s.writes_submitted.to_string()),
                ("ReadsCompleted", s.reads_completed.to_string()),
                ("WritesCompleted", s.writes_completed.to_string()),
                ("SectorsRead", s.sectors_read.to_string()),
                ("SectorsWritten", s.sectors_written.to_string()),
            ],
        );
    }
    w.close();

    w.open("AddressMapping", &[]);
    for (id, m) in mapping.iter().enumerate() {
        w.leaf(
            "Stream",
            &[
                ("Id", id.to_string()),
                ("Translations", m.translations.to_string()),
                ("CmtHits", m.cmt_hits.to_string()),
                ("CmtMisses", m.cmt_misses.to_string()),
            ],
        );
    }
    w.close();

    w.leaf(
        "GcWearLeveling",
        &[
            ("GcInvocations", gc.gc_invocations.to_string()),
            ("StaticWlInvocations", gc.static_wl_invocations.to_string()),
            ("RelocatedPages", gc.relocated_pages.to_string()),
            ("ErasedBlocks", gc.erased_blocks.to_string()),
            ("DroppedStaleMovements", gc.dropped_stale_movements.to_string()),
        ],
    );

    w.open(
        "Scheduler",
        &[
            ("DispatchedBatches", tsu.dispatched_batches.to_string()),
            ("MultiplaneBatches", tsu.multiplane_batches.to_string()),
            ("SuspensionsRequested", tsu.suspensions_requested.to_string()),
        ],
    );
    w.leaf(
        "Issued",
        &[
            ("UserReads", tsu.issued.user_reads.to_string()),
            ("UserWrites", tsu.issued.user_writes.to_string()),
            ("MappingReads", tsu.issued.mapping_reads.to_string()),
            ("MappingWrites", tsu.issued.mapping_writes.to_string()),
            ("GcReads", tsu.issued.gc_reads.to_string()),
            ("GcWrites", tsu.issued.gc_writes.to_string()),
            ("GcErases", tsu.issued.gc_erases.to_string()),
        ],
    );
    w.close();

    w.finish()
}
