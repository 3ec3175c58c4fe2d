//! Grouping operator
//!
//! A streaming windowed aggregator over inbound acquisitions, parameterised
//! by `accept`/`finish` predicates. Images pass through as single-element
//! groups; other record kinds are skipped, not failed.

use log::{debug, warn};

use crate::wire::{Acquisition, Envelope, ACQ_IS_PHASECORR_DATA, ACQ_LAST_IN_SLICE};

/// One unit of work handed to a reconstruction kernel: either a window of
/// acquisitions sharing a slice, or a single passthrough image.
#[derive(Debug)]
pub enum Group {
    Acquisitions(Vec<Acquisition>),
    Image(crate::wire::Image),
}

pub fn default_accept(acq: &Acquisition) -> bool {
    !acq.is_flag_set(ACQ_IS_PHASECORR_DATA)
}

pub fn default_finish(acq: &Acquisition) -> bool {
    acq.is_flag_set(ACQ_LAST_IN_SLICE)
}

/// Accumulates envelopes into [`Group`]s under an `accept`/`finish`
/// predicate pair. Call [`Grouper::push`] for each inbound envelope and
/// drain yielded groups; call [`Grouper::finish_stream`] at end of stream to
/// discard any partial trailing group.
pub struct Grouper<A, F>
where
    A: Fn(&Acquisition) -> bool,
    F: Fn(&Acquisition) -> bool,
{
    accept: A,
    finish: F,
    current: Vec<Acquisition>,
}

impl Grouper<fn(&Acquisition) -> bool, fn(&Acquisition) -> bool> {
    pub fn with_defaults() -> Self {
        Self::new(default_accept, default_finish)
    }
}

impl<A, F> Grouper<A, F>
where
    A: Fn(&Acquisition) -> bool,
    F: Fn(&Acquisition) -> bool,
{
    pub fn new(accept: A, finish: F) -> Self {
        Self { accept, finish, current: Vec::new() }
    }

    /// Feed one inbound envelope. Returns a completed group if this envelope
    /// closed a window, or if the envelope was itself a standalone image.
    pub fn push(&mut self, envelope: Envelope) -> Option<Group> {
        match envelope {
            Envelope::Acquisition(acq) => {
                let is_finish = (self.finish)(&acq);
                if (self.accept)(&acq) {
                    self.current.push(acq);
                }
                if is_finish {
                    let group = std::mem::take(&mut self.current);
                    Some(Group::Acquisitions(group))
                } else {
                    None
                }
            }
            Envelope::Image(image) => Some(Group::Image(image)),
            other => {
                debug!("grouper: skipping non-acquisition, non-image record {:?}", other.kind());
                None
            }
        }
    }

    /// End of stream: any partial group in flight is discarded without being
    /// yielded, matching the source's "incomplete slices are abandoned"
    /// behaviour.
    pub fn finish_stream(&mut self) {
        if !self.current.is_empty() {
            warn!("grouper: discarding {} acquisitions from an unterminated group", self.current.len());
            self.current.clear();
        }
    }
}
