// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Frame queues shared by the encoders.
//!
//! Frames go through `reorder_list` (waiting for their references),
//! are encoded in transmission order, kept in `ref_list` while they are
//! referenced and leave through `output_list` in FIFO order. Decoding
//! timestamps are rebuilt from the presentation timestamps of the input.

use std::collections::VecDeque;
use std::sync::LazyLock;

use crate::importer::ImportedBuffer;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "vaencoder",
        gst::DebugColorFlags::empty(),
        Some("VA encoder queues"),
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    I,
    P,
    B,
}

/// A frame in flight, identified by its system frame number.
#[derive(Debug, Clone, Default)]
pub struct EncodeFrame {
    pub id: u32,
    pub pts: Option<gst::ClockTime>,
    pub dts: Option<gst::ClockTime>,
    pub duration: Option<gst::ClockTime>,
    pub force_keyframe: bool,
    pub input: Option<ImportedBuffer>,
    pub frame_type: FrameType,
    pub poc: u32,
    pub is_ref: bool,
    pub sync_point: bool,
    /// Coded data. `None` when the frame is finished without output.
    pub output: Option<gst::Buffer>,
}

impl EncodeFrame {
    pub fn new(id: u32, pts: Option<gst::ClockTime>, duration: Option<gst::ClockTime>) -> Self {
        EncodeFrame {
            id,
            pts,
            duration,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct EncoderQueues {
    pub reorder_list: VecDeque<EncodeFrame>,
    pub ref_list: VecDeque<EncodeFrame>,
    pub output_list: VecDeque<EncodeFrame>,
    dts_queue: VecDeque<Option<gst::ClockTime>>,
    frame_duration: Option<gst::ClockTime>,
}

impl EncoderQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nominal frame duration from the input framerate.
    pub fn set_frame_duration(&mut self, duration: Option<gst::ClockTime>) {
        self.frame_duration = duration;
    }

    /// Records the PTS of a new input frame.
    ///
    /// The first frame is preceded by `max_reorder_num` earlier slots so
    /// that the DTS never gets ahead of the PTS once frames are reordered.
    pub fn push_dts(&mut self, frame: &EncodeFrame, max_reorder_num: u32) {
        if self.dts_queue.is_empty() && max_reorder_num > 0 {
            let diff = match (frame.duration, self.frame_duration) {
                (Some(d), Some(base)) => d.max(base),
                (Some(d), None) | (None, Some(d)) => d,
                (None, None) => gst::ClockTime::ZERO,
            };

            for i in 0..max_reorder_num {
                let slot = frame
                    .pts
                    .map(|pts| pts.checked_sub(diff * (max_reorder_num - i) as u64).unwrap_or(pts));
                self.dts_queue.push_back(slot);
            }
        }

        self.dts_queue.push_back(frame.pts);
    }

    pub fn pop_dts(&mut self) -> Option<gst::ClockTime> {
        self.dts_queue.pop_front().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.reorder_list.is_empty() && self.output_list.is_empty()
    }

    pub fn clear(&mut self) {
        self.reorder_list.clear();
        self.ref_list.clear();
        self.output_list.clear();
        self.dts_queue.clear();
    }
}

/// The codec specific half of an encoder.
pub trait CodecEncoder {
    /// Frames that can be held back for reordering.
    fn max_reorder_num(&self) -> u32;

    /// Queues `frame`, if any, and returns the next frame ready to be
    /// encoded. `bump_all` releases everything held.
    fn reorder(
        &mut self,
        queues: &mut EncoderQueues,
        frame: Option<EncodeFrame>,
        bump_all: bool,
    ) -> Result<Option<EncodeFrame>, gst::FlowError>;

    /// Encodes `frame` into its output buffer and updates `ref_list`.
    fn encode(
        &mut self,
        queues: &mut EncoderQueues,
        frame: &mut EncodeFrame,
        is_last: bool,
    ) -> Result<(), gst::FlowError>;
}

/// Hands finished frames downstream.
pub trait FrameFinisher {
    fn finish_frame(&mut self, frame: EncodeFrame) -> Result<gst::FlowSuccess, gst::FlowError>;
}

/// Drives a [`CodecEncoder`] over the queues, making sure every frame that
/// went in is finished exactly once.
#[derive(Debug, Default)]
pub struct EncoderCore<C> {
    pub queues: EncoderQueues,
    pub codec: C,
}

impl<C: CodecEncoder> EncoderCore<C> {
    pub fn new(codec: C) -> Self {
        EncoderCore {
            queues: EncoderQueues::new(),
            codec,
        }
    }

    fn encode_one(&mut self, frame: &mut EncodeFrame, is_last: bool) -> Result<(), gst::FlowError> {
        self.codec.encode(&mut self.queues, frame, is_last)?;
        frame.dts = self.queues.pop_dts();
        gst::trace!(
            CAT,
            "Encoded frame {} ({:?}, poc {}), dts {:?}",
            frame.id,
            frame.frame_type,
            frame.poc,
            frame.dts
        );
        Ok(())
    }

    fn push_out_one<F: FrameFinisher>(
        &mut self,
        finisher: &mut F,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        match self.queues.output_list.pop_front() {
            Some(frame) => finisher.finish_frame(frame),
            None => Ok(gst::FlowSuccess::Ok),
        }
    }

    /// Finishes `in_flight` and everything queued without output.
    fn purge<F: FrameFinisher>(&mut self, finisher: &mut F, in_flight: Option<EncodeFrame>) {
        let queued = self
            .queues
            .output_list
            .drain(..)
            .chain(self.queues.reorder_list.drain(..))
            .collect::<Vec<_>>();

        for mut frame in in_flight.into_iter().chain(queued) {
            gst::debug!(CAT, "Dropping frame {}", frame.id);
            frame.output = None;
            let _ = finisher.finish_frame(frame);
        }

        self.queues.ref_list.clear();
    }

    pub fn handle_frame<F: FrameFinisher>(
        &mut self,
        finisher: &mut F,
        frame: EncodeFrame,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let max_reorder_num = self.codec.max_reorder_num();
        self.queues.push_dts(&frame, max_reorder_num);

        let mut ret = Ok(gst::FlowSuccess::Ok);
        let mut next = match self.codec.reorder(&mut self.queues, Some(frame), false) {
            Ok(next) => next,
            Err(err) => {
                gst::error!(CAT, "Failed to reorder frame: {:?}", err);
                self.purge(finisher, None);
                return Err(err);
            }
        };

        while let Some(mut frame) = next.take() {
            if let Err(err) = self.encode_one(&mut frame, false) {
                gst::error!(CAT, "Failed to encode frame {}: {:?}", frame.id, err);
                self.purge(finisher, Some(frame));
                return Err(err);
            }
            self.queues.output_list.push_back(frame);

            while !self.queues.output_list.is_empty() {
                ret = self.push_out_one(finisher);
                if let Err(err) = ret {
                    self.purge(finisher, None);
                    return Err(err);
                }
            }

            next = match self.codec.reorder(&mut self.queues, None, false) {
                Ok(next) => next,
                Err(err) => {
                    self.purge(finisher, None);
                    return Err(err);
                }
            };
        }

        ret
    }

    /// Encodes and outputs every frame held back.
    pub fn drain<F: FrameFinisher>(
        &mut self,
        finisher: &mut F,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        gst::debug!(CAT, "Draining {} frames", self.queues.reorder_list.len());

        let mut next = match self.codec.reorder(&mut self.queues, None, true) {
            Ok(next) => next,
            Err(err) => {
                self.purge(finisher, None);
                return Err(err);
            }
        };

        while let Some(mut frame) = next.take() {
            let is_last = self.queues.reorder_list.is_empty();
            if let Err(err) = self.encode_one(&mut frame, is_last) {
                gst::error!(CAT, "Failed to encode frame {}: {:?}", frame.id, err);
                self.purge(finisher, Some(frame));
                return Err(err);
            }
            self.queues.output_list.push_back(frame);

            if let Err(err) = self.push_out_one(finisher) {
                self.purge(finisher, None);
                return Err(err);
            }

            next = match self.codec.reorder(&mut self.queues, None, true) {
                Ok(next) => next,
                Err(err) => {
                    self.purge(finisher, None);
                    return Err(err);
                }
            };
        }

        debug_assert!(self.queues.reorder_list.is_empty());

        while !self.queues.output_list.is_empty() {
            if let Err(err) = self.push_out_one(finisher) {
                self.purge(finisher, None);
                return Err(err);
            }
        }

        self.queues.ref_list.clear();
        Ok(gst::FlowSuccess::Ok)
    }
}

/// GOP structure with B frames between anchors, no pyramid.
#[derive(Debug, Clone)]
pub struct GopReorder {
    idr_period: u32,
    ip_period: u32,
    num_ref_frames: u32,
    max_poc: u32,
    cur_frame_index: u32,
}

impl GopReorder {
    pub fn new(idr_period: u32, num_bframes: u32, num_ref_frames: u32) -> Self {
        let idr_period = idr_period.max(1);
        GopReorder {
            idr_period,
            ip_period: (num_bframes + 1).min(idr_period),
            num_ref_frames: num_ref_frames.max(1),
            max_poc: (idr_period * 2).next_power_of_two().max(16),
            cur_frame_index: idr_period,
        }
    }

    pub fn has_bframes(&self) -> bool {
        self.ip_period > 1
    }

    pub fn max_reorder_num(&self) -> u32 {
        u32::from(self.has_bframes())
    }

    fn frame_type(&self, index: u32) -> (FrameType, bool) {
        if index == 0 {
            (FrameType::I, true)
        } else if index % self.ip_period == 0 || index == self.idr_period - 1 {
            (FrameType::P, true)
        } else {
            (FrameType::B, false)
        }
    }

    pub fn push(&mut self, queues: &mut EncoderQueues, frame: Option<EncodeFrame>, last: bool) {
        if let Some(mut frame) = frame {
            if self.cur_frame_index == self.idr_period {
                debug_assert!(queues.reorder_list.is_empty());
                self.cur_frame_index = 0;
            }

            frame.poc = (self.cur_frame_index * 2) % self.max_poc;
            let (frame_type, is_ref) = self.frame_type(self.cur_frame_index);
            frame.frame_type = frame_type;
            frame.is_ref = is_ref;

            if self.cur_frame_index == 0 {
                gst::log!(CAT, "Frame {} starts a new GOP", frame.id);
                queues.ref_list.clear();
                frame.sync_point = true;
            }

            if frame.force_keyframe && frame.frame_type != FrameType::I {
                gst::debug!(CAT, "Promoting forced key frame {} to I", frame.id);
                frame.frame_type = FrameType::I;
                frame.is_ref = true;
            }

            self.cur_frame_index += 1;
            queues.reorder_list.push_back(frame);
        }

        // The GOP ends on an anchor
        if last && self.cur_frame_index < self.idr_period {
            self.cur_frame_index = self.idr_period;
            if let Some(tail) = queues.reorder_list.back_mut() {
                if tail.frame_type == FrameType::B {
                    tail.frame_type = FrameType::P;
                    tail.is_ref = true;
                }
            }
        }
    }

    pub fn pop(&mut self, queues: &mut EncoderQueues) -> Option<EncodeFrame> {
        let tail = queues.reorder_list.back()?;
        if tail.frame_type != FrameType::B {
            return queues.reorder_list.pop_back();
        }

        if self.cur_frame_index == self.idr_period {
            return queues.reorder_list.pop_front();
        }

        // A B frame needs its backward reference encoded first
        let head = queues.reorder_list.front()?;
        let backward = queues.ref_list.iter().filter(|f| f.poc > head.poc).count();
        if backward >= 1 {
            return queues.reorder_list.pop_front();
        }

        None
    }

    pub fn reorder(
        &mut self,
        queues: &mut EncoderQueues,
        frame: Option<EncodeFrame>,
        bump_all: bool,
    ) -> Option<EncodeFrame> {
        self.push(queues, frame, bump_all);
        self.pop(queues)
    }

    /// Keeps `frame` as a reference if it is one, dropping the oldest
    /// reference when there are too many.
    pub fn update_refs(&self, queues: &mut EncoderQueues, frame: &EncodeFrame) {
        if !frame.is_ref {
            return;
        }
        if queues.ref_list.len() >= self.num_ref_frames as usize {
            queues.ref_list.pop_front();
        }
        let mut reference = frame.clone();
        reference.output = None;
        queues.ref_list.push_back(reference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCodec {
        gop: GopReorder,
        fail_on: Option<u32>,
    }

    impl CodecEncoder for TestCodec {
        fn max_reorder_num(&self) -> u32 {
            self.gop.max_reorder_num()
        }

        fn reorder(
            &mut self,
            queues: &mut EncoderQueues,
            frame: Option<EncodeFrame>,
            bump_all: bool,
        ) -> Result<Option<EncodeFrame>, gst::FlowError> {
            Ok(self.gop.reorder(queues, frame, bump_all))
        }

        fn encode(
            &mut self,
            queues: &mut EncoderQueues,
            frame: &mut EncodeFrame,
            _is_last: bool,
        ) -> Result<(), gst::FlowError> {
            if self.fail_on == Some(frame.id) {
                return Err(gst::FlowError::Error);
            }
            frame.output = Some(gst::Buffer::from_slice(vec![frame.id as u8]));
            self.gop.update_refs(queues, frame);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect(Vec<EncodeFrame>);

    impl FrameFinisher for Collect {
        fn finish_frame(&mut self, frame: EncodeFrame) -> Result<gst::FlowSuccess, gst::FlowError> {
            self.0.push(frame);
            Ok(gst::FlowSuccess::Ok)
        }
    }

    fn frame(id: u32) -> EncodeFrame {
        EncodeFrame::new(
            id,
            Some(gst::ClockTime::from_seconds(1) + gst::ClockTime::from_mseconds(40 * id as u64)),
            Some(gst::ClockTime::from_mseconds(40)),
        )
    }

    #[test]
    fn b_frames_follow_their_anchor() {
        gst::init().unwrap();

        let mut core = EncoderCore::new(TestCodec {
            gop: GopReorder::new(30, 2, 2),
            fail_on: None,
        });
        let mut out = Collect::default();

        for id in 0..5 {
            core.handle_frame(&mut out, frame(id)).unwrap();
        }
        let order = out.0.iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(order, vec![0, 3, 1, 2]);

        core.drain(&mut out).unwrap();
        let order = out.0.iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(order, vec![0, 3, 1, 2, 4]);
        assert_eq!(out.0[4].frame_type, FrameType::P);
        assert!(out.0[0].sync_point);
        assert!(core.queues.is_empty());
        assert!(core.queues.ref_list.is_empty());

        // DTS never passes PTS and never goes back
        let mut last = gst::ClockTime::ZERO;
        for f in &out.0 {
            let dts = f.dts.unwrap();
            assert!(dts <= f.pts.unwrap());
            assert!(dts >= last);
            last = dts;
        }
        assert_eq!(out.0[0].dts, Some(gst::ClockTime::from_mseconds(960)));
    }

    #[test]
    fn failure_finishes_every_frame() {
        gst::init().unwrap();

        let mut core = EncoderCore::new(TestCodec {
            gop: GopReorder::new(30, 2, 2),
            fail_on: Some(1),
        });
        let mut out = Collect::default();

        core.handle_frame(&mut out, frame(0)).unwrap();
        core.handle_frame(&mut out, frame(1)).unwrap();
        core.handle_frame(&mut out, frame(2)).unwrap();
        assert_eq!(
            core.handle_frame(&mut out, frame(3)),
            Err(gst::FlowError::Error)
        );

        let mut ids = out.0.iter().map(|f| f.id).collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(out.0.iter().find(|f| f.id == 1).unwrap().output.is_none());
        assert!(out.0.iter().find(|f| f.id == 2).unwrap().output.is_none());
        assert!(out.0.iter().find(|f| f.id == 3).unwrap().output.is_some());
        assert!(core.queues.is_empty());
        assert!(core.queues.ref_list.is_empty());
    }

    #[test]
    fn drain_failure_finishes_every_frame() {
        gst::init().unwrap();

        let mut core = EncoderCore::new(TestCodec {
            gop: GopReorder::new(30, 3, 2),
            fail_on: Some(2),
        });
        let mut out = Collect::default();

        for id in 0..4 {
            core.handle_frame(&mut out, frame(id)).unwrap();
        }
        assert_eq!(out.0.len(), 1);

        assert!(core.drain(&mut out).is_err());
        let mut ids = out.0.iter().map(|f| f.id).collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(core.queues.is_empty());
    }

    #[test]
    fn forced_keyframe_is_promoted() {
        gst::init().unwrap();

        let mut gop = GopReorder::new(30, 0, 1);
        let mut queues = EncoderQueues::new();

        let first = gop.reorder(&mut queues, Some(frame(0)), false).unwrap();
        assert_eq!(first.frame_type, FrameType::I);

        let mut forced = frame(1);
        forced.force_keyframe = true;
        let forced = gop.reorder(&mut queues, Some(forced), false).unwrap();
        assert_eq!(forced.frame_type, FrameType::I);
        assert!(forced.is_ref);
    }

    #[test]
    fn dts_seed_without_underflow() {
        gst::init().unwrap();

        let mut queues = EncoderQueues::new();
        queues.set_frame_duration(Some(gst::ClockTime::from_mseconds(50)));
        let first = EncodeFrame::new(
            0,
            Some(gst::ClockTime::from_mseconds(30)),
            Some(gst::ClockTime::from_mseconds(40)),
        );
        queues.push_dts(&first, 2);

        assert_eq!(queues.pop_dts(), Some(gst::ClockTime::from_mseconds(30)));
        assert_eq!(queues.pop_dts(), Some(gst::ClockTime::from_mseconds(30)));
        assert_eq!(queues.pop_dts(), Some(gst::ClockTime::from_mseconds(30)));
        assert_eq!(queues.pop_dts(), None);
    }
}
