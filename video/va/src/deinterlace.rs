// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Reference window of the deinterlacer.
//!
//! Input frames enter a ring of at most [`MAX_HISTORY`] entries. Once the
//! ring is full, the frame at `hcurr` is deinterlaced twice, once per field,
//! with the older entries as forward references and the newer ones as
//! backward references.

use gst_video::prelude::*;
use std::collections::VecDeque;
use std::sync::LazyLock;
use thiserror::Error;

use crate::device::SurfaceFlags;
use crate::importer::ImportedBuffer;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vadeinterlacewindow",
        gst::DebugColorFlags::empty(),
        Some("VA deinterlace reference window"),
    )
});

pub const MAX_HISTORY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("{0} reference frames needed, at most {max} supported", max = MAX_HISTORY)]
    TooDeep(usize),
}

/// Anything the window can hold.
pub trait WindowEntry: Clone {
    fn buffer(&self) -> &gst::BufferRef;
}

impl WindowEntry for gst::Buffer {
    fn buffer(&self) -> &gst::BufferRef {
        self.as_ref()
    }
}

impl WindowEntry for ImportedBuffer {
    fn buffer(&self) -> &gst::BufferRef {
        ImportedBuffer::buffer(self).as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldState {
    #[default]
    Unknown,
    FirstField,
    SecondField,
    Finished,
}

/// One output to produce: a field of `current`.
#[derive(Debug, Clone)]
pub struct FieldJob<T> {
    pub current: T,
    /// Past frames, nearest first.
    pub forward: Vec<T>,
    /// Future frames, nearest first.
    pub backward: Vec<T>,
    /// `TOP_FIELD` or `BOTTOM_FIELD`.
    pub field: SurfaceFlags,
    pub second_field: bool,
    pub pts: Option<gst::ClockTime>,
    pub duration: Option<gst::ClockTime>,
}

#[derive(Debug)]
pub struct DeinterlaceWindow<T> {
    history: VecDeque<T>,
    hcurr: usize,
    hdepth: usize,
    state: FieldState,
    default_duration: Option<gst::ClockTime>,
    top_field_first: bool,
    reverse: bool,
}

impl<T> Default for DeinterlaceWindow<T> {
    fn default() -> Self {
        DeinterlaceWindow {
            history: VecDeque::with_capacity(MAX_HISTORY),
            hcurr: 0,
            hdepth: 1,
            state: FieldState::Unknown,
            default_duration: None,
            top_field_first: true,
            reverse: false,
        }
    }
}

impl<T: WindowEntry> DeinterlaceWindow<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizes the window for a method needing `forward` past and
    /// `backward` future frames. Drops everything held.
    pub fn configure(&mut self, forward: u32, backward: u32) -> Result<(), WindowError> {
        let depth = forward as usize + backward as usize + 1;
        self.reset();
        if depth > MAX_HISTORY {
            gst::error!(CAT, "Reference window of {} frames is too deep", depth);
            return Err(WindowError::TooDeep(depth));
        }

        self.hdepth = depth;
        self.hcurr = forward as usize;
        gst::debug!(
            CAT,
            "Window of {} frames, current at {}",
            self.hdepth,
            self.hcurr
        );
        Ok(())
    }

    /// Frame duration used when input buffers carry none.
    pub fn set_default_duration(&mut self, duration: Option<gst::ClockTime>) {
        self.default_duration = duration;
    }

    /// Field order of frames without a `TFF` flag of their own.
    pub fn set_top_field_first(&mut self, tff: bool) {
        self.top_field_first = tff;
    }

    /// Reverse playback emits the fields in opposite order.
    pub fn set_reverse(&mut self, reverse: bool) {
        self.reverse = reverse;
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.state = FieldState::Unknown;
    }

    pub fn depth(&self) -> usize {
        self.hdepth
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn state(&self) -> FieldState {
        self.state
    }

    /// Latency introduced by waiting for the window to fill.
    pub fn latency(&self) -> Option<gst::ClockTime> {
        self.default_duration
            .map(|d| d * (2 + self.hdepth as u64))
    }

    pub fn push(&mut self, entry: T) {
        if self.history.len() >= self.hdepth {
            self.history.pop_front();
        }
        self.history.push_back(entry);

        if self.history.len() == self.hdepth {
            self.state = FieldState::FirstField;
        }
    }

    fn first_field_is_top(&self, buffer: &gst::BufferRef) -> bool {
        let flags = buffer.video_flags();
        let tff = if flags.contains(gst_video::VideoBufferFlags::INTERLACED) {
            flags.contains(gst_video::VideoBufferFlags::TFF)
        } else {
            self.top_field_first
        };
        tff != self.reverse
    }

    /// The next field to produce, if the window is ready for one.
    pub fn next_field(&mut self) -> Option<FieldJob<T>> {
        let second_field = match self.state {
            FieldState::FirstField => false,
            FieldState::SecondField => true,
            FieldState::Unknown | FieldState::Finished => return None,
        };
        if self.history.len() < self.hdepth {
            return None;
        }

        let current = self.history[self.hcurr].clone();
        let forward = self
            .history
            .iter()
            .take(self.hcurr)
            .rev()
            .cloned()
            .collect::<Vec<_>>();
        let backward = self
            .history
            .iter()
            .skip(self.hcurr + 1)
            .cloned()
            .collect::<Vec<_>>();

        let buffer = current.buffer();
        let top = self.first_field_is_top(buffer) != second_field;
        let duration = buffer.duration().map(|d| d / 2).or(self.default_duration);
        let pts = if second_field {
            buffer.pts().map(|pts| pts + duration.unwrap_or(gst::ClockTime::ZERO))
        } else {
            buffer.pts()
        };

        self.state = if second_field {
            FieldState::Finished
        } else {
            FieldState::SecondField
        };

        gst::trace!(
            CAT,
            "{} field of {:?}, {} forward / {} backward references",
            if top { "Top" } else { "Bottom" },
            buffer.pts(),
            forward.len(),
            backward.len()
        );

        Some(FieldJob {
            current,
            forward,
            backward,
            field: if top {
                SurfaceFlags::TOP_FIELD
            } else {
                SurfaceFlags::BOTTOM_FIELD
            },
            second_field,
            pts,
            duration,
        })
    }
}
