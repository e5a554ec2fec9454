use super::Checkpoint;
use crate::deflate::{BlockState, Window};

/// Decides checkpoint placement while output streams past.
///
/// The recorder only observes: it is fed every decoded chunk and asked to
/// record at moments when the decoder can report its state. It keeps its own
/// copy of the recent output and never touches the decoder.
pub struct CheckpointRecorder {
    span: u64,
    member_id: u32,
    history: Window,
    /// Bytes of the current member observed so far.
    produced: u64,
    since_last: u64,
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointRecorder {
    pub fn new(span: u64) -> Self {
        Self {
            span,
            member_id: 0,
            history: Window::new(),
            produced: 0,
            since_last: 0,
            checkpoints: Vec::new(),
        }
    }

    /// Start a member whose deflate data begins at `bit_offset`.
    pub fn begin_member(&mut self, member_id: u32, bit_offset: u64) {
        self.member_id = member_id;
        self.history.clear();
        self.produced = 0;
        self.since_last = 0;
        self.checkpoints.clear();
        self.checkpoints.push(Checkpoint {
            uncompressed_offset: 0,
            compressed_bit_offset: bit_offset,
            window: Vec::new(),
            member_id,
            block: BlockState::Boundary,
        });
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        self.history.extend(chunk);
        self.produced += chunk.len() as u64;
        self.since_last += chunk.len() as u64;
    }

    /// Whether a checkpoint should be taken at the next opportunity.
    pub fn is_due(&self) -> bool {
        self.since_last >= self.span
    }

    /// Bytes to observe before a checkpoint becomes due.
    pub fn until_due(&self) -> u64 {
        self.span.saturating_sub(self.since_last)
    }

    /// Snapshot the current position.
    pub fn record(&mut self, bit_offset: u64, block: BlockState) {
        tracing::trace!(
            member = self.member_id,
            offset = self.produced,
            bit_offset,
            "checkpoint"
        );
        self.checkpoints.push(Checkpoint {
            uncompressed_offset: self.produced,
            compressed_bit_offset: bit_offset,
            window: self.history.snapshot(),
            member_id: self.member_id,
            block,
        });
        self.since_last = 0;
    }

    /// Close the member and return its checkpoints (member-relative offsets).
    ///
    /// A checkpoint sitting exactly at the member's end is dropped: nothing
    /// can be decoded from it.
    pub fn finish_member(&mut self) -> Vec<Checkpoint> {
        if self.checkpoints.len() > 1
            && self
                .checkpoints
                .last()
                .is_some_and(|cp| cp.uncompressed_offset == self.produced)
        {
            self.checkpoints.pop();
        }
        std::mem::take(&mut self.checkpoints)
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_after_span() {
        let mut rec = CheckpointRecorder::new(100);
        rec.begin_member(0, 80);
        assert!(!rec.is_due());

        rec.observe(&[1u8; 60]);
        assert_eq!(rec.until_due(), 40);
        rec.observe(&[2u8; 50]);
        assert!(rec.is_due());

        rec.record(900, BlockState::Boundary);
        assert!(!rec.is_due());
        rec.observe(&[3u8; 10]);

        let cps = rec.finish_member();
        assert_eq!(cps.len(), 2);
        assert_eq!(cps[0].uncompressed_offset, 0);
        assert!(cps[0].window.is_empty());
        assert_eq!(cps[1].uncompressed_offset, 110);
        assert_eq!(cps[1].window.len(), 110);
        assert_eq!(&cps[1].window[100..], &[2u8; 10]);
    }

    #[test]
    fn drops_checkpoint_at_member_end() {
        let mut rec = CheckpointRecorder::new(10);
        rec.begin_member(3, 0);
        rec.observe(&[0u8; 10]);
        rec.record(64, BlockState::Boundary);
        let cps = rec.finish_member();
        assert_eq!(cps.len(), 1);
        assert_eq!(cps[0].member_id, 3);
    }

    #[test]
    fn window_resets_between_members() {
        let mut rec = CheckpointRecorder::new(5);
        rec.begin_member(0, 0);
        rec.observe(b"abcdefgh");
        rec.finish_member();

        rec.begin_member(1, 500);
        rec.observe(b"xyzxyz");
        rec.record(600, BlockState::Boundary);
        rec.observe(b"!");
        let cps = rec.finish_member();
        assert_eq!(cps[1].window, b"xyzxyz");
    }
}
