//! Terminal progress display.
//!
//! Each written record prints one symbol identifying its source; every
//! [`LINE_WIDTH`] records the row ends with the running total. Sources get
//! symbols in first-seen order from a fixed alphabet, and every source past the
//! alphabet shares [`OVERFLOW_SYMBOL`].

use std::collections::HashMap;
use std::io::{self, Write};

const SYMBOLS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub const OVERFLOW_SYMBOL: char = '*';

/// Records per display row.
pub const LINE_WIDTH: u64 = 80;

/// Sources shown at each end of a truncated summary.
const LISTING_EDGE: usize = 5;

pub struct Progress<W: Write> {
    out: Option<W>,
    symbols: HashMap<String, char>,
    /// Sources in first-seen order
    seen: Vec<String>,
    count: u64,
    last_break: u64,
    finished: bool,
}

impl Progress<io::Stderr> {
    /// Progress on stderr, or a no-op meter when disabled.
    pub fn stderr(enabled: bool) -> Self {
        if enabled {
            Self::new(io::stderr())
        } else {
            Self::disabled()
        }
    }
}

impl<W: Write> Progress<W> {
    pub fn new(out: W) -> Self {
        Self::with_output(Some(out))
    }

    pub fn disabled() -> Self {
        Self::with_output(None)
    }

    fn with_output(out: Option<W>) -> Self {
        Self {
            out,
            symbols: HashMap::new(),
            seen: Vec::new(),
            count: 0,
            last_break: 0,
            finished: false,
        }
    }

    fn symbol_for(&mut self, source: &str) -> char {
        if let Some(symbol) = self.symbols.get(source) {
            return *symbol;
        }
        let symbol = SYMBOLS
            .get(self.seen.len())
            .map_or(OVERFLOW_SYMBOL, |b| char::from(*b));
        self.symbols.insert(source.to_string(), symbol);
        self.seen.push(source.to_string());
        symbol
    }

    /// Notes one written record; `count` is the total written so far.
    pub fn record(&mut self, count: u64, source: &str) -> io::Result<()> {
        if self.out.is_none() {
            return Ok(());
        }
        let symbol = self.symbol_for(source);
        self.count = count;

        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        write!(out, "{symbol}")?;
        if count % LINE_WIDTH == 0 {
            writeln!(out, " {count} {}", timestamp())?;
            self.last_break = count;
        }
        out.flush()
    }

    /// Ends the partial row and prints the source summary. Runs once.
    pub fn finish(&mut self) -> io::Result<()> {
        if std::mem::replace(&mut self.finished, true) {
            return Ok(());
        }
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };

        if self.count != self.last_break {
            let pad = usize::try_from(LINE_WIDTH - self.count % LINE_WIDTH).unwrap_or(0);
            writeln!(out, "{:pad$} {} {}", "", self.count, timestamp())?;
        }

        let n = self.seen.len();
        writeln!(out, "{n} {}:", if n == 1 { "source" } else { "sources" })?;
        let listed: Vec<&String> = if n > 2 * LISTING_EDGE {
            self.seen[..LISTING_EDGE]
                .iter()
                .chain(&self.seen[n - LISTING_EDGE..])
                .collect()
        } else {
            self.seen.iter().collect()
        };
        for (i, source) in listed.iter().enumerate() {
            if n > 2 * LISTING_EDGE && i == LISTING_EDGE {
                writeln!(out, "  ...")?;
            }
            writeln!(out, "  {} {source}", self.symbols[source.as_str()])?;
        }
        out.flush()
    }

    #[cfg(test)]
    pub fn into_inner(self) -> Option<W> {
        self.out
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
