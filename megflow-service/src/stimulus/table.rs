// Event Tables
// Parsing, masking, delay correction and concatenation of trigger events

use super::StimulusError;

use std::fmt::Write as _;

/// One trigger transition: onset sample, code before the onset, new code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub sample: u64,
    pub previous: u32,
    pub code: u32,
}

impl Event {
    pub fn new(sample: u64, previous: u32, code: u32) -> Self {
        Self {
            sample,
            previous,
            code,
        }
    }
}

/// Events of one recording, with the timing needed to combine runs
///
/// Sample indices are absolute, i.e. they already include `first_samp`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTable {
    pub sfreq: f64,
    /// Number of samples in the recording the events belong to
    pub n_samples: u64,
    pub first_samp: u64,
    pub events: Vec<Event>,
}

impl EventTable {
    /// Parse the `-eve.txt` text format
    ///
    /// Header comments `# sfreq:`, `# n_samples:` and `# first_samp:` carry
    /// the recording timing; other comments are ignored. Rows are
    /// `<sample> <previous> <code>`, optionally with the onset time in
    /// seconds as a second column.
    pub fn parse(content: &str) -> Result<Self, StimulusError> {
        let mut sfreq = None;
        let mut n_samples = None;
        let mut first_samp = 0;
        let mut events = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(comment) = line.strip_prefix('#') {
                let Some((key, value)) = comment.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                match key.trim() {
                    "sfreq" => sfreq = Some(parse_field::<f64>(value, line_no, "sfreq")?),
                    "n_samples" => n_samples = Some(parse_field::<u64>(value, line_no, "n_samples")?),
                    "first_samp" => first_samp = parse_field::<u64>(value, line_no, "first_samp")?,
                    _ => {}
                }
                continue;
            }

            events.push(parse_row(line, line_no)?);
        }

        let sfreq = sfreq.ok_or(StimulusError::MissingHeader("sfreq"))?;
        if sfreq.is_nan() || sfreq <= 0.0 {
            return Err(StimulusError::MissingHeader("sfreq"));
        }

        Ok(Self {
            sfreq,
            n_samples: n_samples.ok_or(StimulusError::MissingHeader("n_samples"))?,
            first_samp,
            events,
        })
    }

    /// Render in the format accepted by [`EventTable::parse`]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# sfreq: {}", self.sfreq);
        let _ = writeln!(out, "# n_samples: {}", self.n_samples);
        let _ = writeln!(out, "# first_samp: {}", self.first_samp);
        for event in &self.events {
            let _ = writeln!(out, "{} {} {}", event.sample, event.previous, event.code);
        }
        out
    }

    /// Apply a trigger mask to every event
    pub fn masked(&self, mask: TriggerMask) -> Self {
        Self {
            events: mask.apply(&self.events),
            ..self.clone()
        }
    }

    /// Move every event later by `delay` samples
    pub fn shifted(&self, delay: u64) -> Self {
        Self {
            events: self
                .events
                .iter()
                .map(|e| Event::new(e.sample + delay, e.previous, e.code))
                .collect(),
            ..self.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_sorted(&self) -> bool {
        self.events.windows(2).all(|w| w[0].sample <= w[1].sample)
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, line: usize, field: &str) -> Result<T, StimulusError> {
    value.parse().map_err(|_| StimulusError::Parse {
        line,
        message: format!("invalid {} '{}'", field, value),
    })
}

fn parse_row(line: &str, line_no: usize) -> Result<Event, StimulusError> {
    let columns: Vec<&str> = line.split_whitespace().collect();
    let (sample, previous, code) = match columns.as_slice() {
        [sample, previous, code] => (sample, previous, code),
        [sample, _time, previous, code] => (sample, previous, code),
        _ => {
            return Err(StimulusError::Parse {
                line: line_no,
                message: format!("expected 3 or 4 columns, found {}", columns.len()),
            })
        }
    };

    Ok(Event::new(
        parse_field(sample, line_no, "sample")?,
        parse_field(previous, line_no, "previous code")?,
        parse_field(code, line_no, "code")?,
    ))
}

/// Trigger bits to clear before events are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMask(pub u32);

impl TriggerMask {
    /// Mask the trigger channel, then keep the onsets that still change it
    ///
    /// Rows are read as successive levels of the channel. After clearing the
    /// masked bits an event survives only if its code is non-zero and differs
    /// from the masked level before it, so a transition touching masked bits
    /// alone never becomes a second event.
    pub fn apply(&self, events: &[Event]) -> Vec<Event> {
        let mut kept = Vec::with_capacity(events.len());
        let mut level = None;
        for event in events {
            let previous = level.unwrap_or(event.previous & !self.0);
            let code = event.code & !self.0;
            level = Some(code);
            if code != 0 && code != previous {
                kept.push(Event::new(event.sample, previous, code));
            }
        }
        kept
    }
}

/// Stimulus delay expressed in whole samples
pub fn delay_in_samples(sfreq: f64, delay_s: f64) -> u64 {
    (delay_s * sfreq).round().max(0.0) as u64
}

/// Combine per-run tables into the timeline of the concatenated recording
///
/// Run `k` is shifted by the samples of all preceding runs, measured from the
/// first run's `first_samp`. Runs must share a sampling rate.
pub fn concatenate(segments: &[EventTable]) -> Result<EventTable, StimulusError> {
    let first = segments.first().ok_or(StimulusError::Empty)?;

    let mut events = Vec::with_capacity(segments.iter().map(EventTable::len).sum());
    let mut start = first.first_samp;
    for (run, segment) in segments.iter().enumerate() {
        if segment.sfreq != first.sfreq {
            return Err(StimulusError::SampleRateMismatch {
                expected: first.sfreq,
                found: segment.sfreq,
            });
        }
        for e in &segment.events {
            let offset = e.sample.checked_sub(segment.first_samp).ok_or(
                StimulusError::BeforeFirstSample {
                    run: run + 1,
                    sample: e.sample,
                    first_samp: segment.first_samp,
                },
            )?;
            events.push(Event::new(start + offset, e.previous, e.code));
        }
        start += segment.n_samples;
    }

    Ok(EventTable {
        sfreq: first.sfreq,
        n_samples: start - first.first_samp,
        first_samp: first.first_samp,
        events,
    })
}
