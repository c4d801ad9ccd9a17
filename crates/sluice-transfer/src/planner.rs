/// Half-open byte range `[start, end)` of the file, fetched over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub start: u64,
    pub end: u64,
}

impl Frame {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Split `total_size` bytes into at most `max_frame_count` contiguous frames.
///
/// Small files use `min_frame_size` frames. Once that would need more than
/// `max_frame_count` frames, the file is divided into `max_frame_count - 1`
/// equal frames plus a remainder frame (dropped when the division is exact).
/// Every frame except the last is at least `min_frame_size` bytes.
pub fn plan(total_size: u64, min_frame_size: u64, max_frame_count: usize) -> Vec<Frame> {
    if total_size == 0 {
        return Vec::new();
    }
    let min_frame_size = min_frame_size.max(1);
    let max_frame_count = max_frame_count.max(1) as u64;

    let frame_size = if max_frame_count == 1 {
        total_size
    } else if total_size <= min_frame_size.saturating_mul(max_frame_count) {
        min_frame_size
    } else {
        let size = total_size / (max_frame_count - 1);
        // Only reachable when min_frame_size < max_frame_count: the remainder
        // would spill past the cap, so spread evenly instead.
        if total_size.div_ceil(size) > max_frame_count {
            total_size.div_ceil(max_frame_count)
        } else {
            size
        }
    };

    let frame_count = total_size.div_ceil(frame_size);
    (0..frame_count)
        .map(|i| i * frame_size)
        .take_while(|start| *start < total_size)
        .map(|start| Frame {
            start,
            end: (start + frame_size).min(total_size),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn assert_covers(frames: &[Frame], total: u64, max: usize) {
        assert!(!frames.is_empty());
        assert!(frames.len() <= max, "{} frames > max {}", frames.len(), max);
        assert_eq!(frames[0].start, 0);
        for pair in frames.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap");
        }
        for frame in frames {
            assert!(!frame.is_empty());
        }
        assert_eq!(frames.last().unwrap().end, total);
    }

    #[test]
    fn empty_file_has_no_frames() {
        assert!(plan(0, 10 * MB, 100).is_empty());
    }

    #[test]
    fn one_byte() {
        assert_eq!(plan(1, 10 * MB, 100), vec![Frame { start: 0, end: 1 }]);
    }

    #[test]
    fn exactly_min_frame() {
        assert_eq!(plan(10 * MB, 10 * MB, 100), vec![Frame { start: 0, end: 10 * MB }]);
    }

    #[test]
    fn min_frame_plus_one() {
        let frames = plan(10 * MB + 1, 10 * MB, 100);
        assert_eq!(
            frames,
            vec![
                Frame { start: 0, end: 10 * MB },
                Frame { start: 10 * MB, end: 10 * MB + 1 },
            ]
        );
    }

    #[test]
    fn at_cap_uses_min_frames() {
        let frames = plan(1000 * MB, 10 * MB, 100);
        assert_eq!(frames.len(), 100);
        assert!(frames.iter().all(|f| f.len() == 10 * MB));
    }

    #[test]
    fn above_cap_divides_by_count_minus_one() {
        let total = 1000 * MB + 1;
        let frames = plan(total, 10 * MB, 100);
        assert_covers(&frames, total, 100);
        assert_eq!(frames.len(), 100);
        assert_eq!(frames[0].len(), total / 99);
        assert!(frames.last().unwrap().len() < total / 99);
    }

    #[test]
    fn exact_division_drops_remainder_frame() {
        let total = 99 * 11 * MB;
        let frames = plan(total, 10 * MB, 100);
        assert_eq!(frames.len(), 99);
        assert!(frames.iter().all(|f| f.len() == 11 * MB));
    }

    #[test]
    fn frames_respect_min_size_except_last() {
        for total in [1, 9, 10, 11, 99, 100, 101, 999, 1000, 1001, 12_345, 99_999] {
            let frames = plan(total, 10, 100);
            assert_covers(&frames, total, 100);
            for frame in &frames[..frames.len() - 1] {
                assert!(frame.len() >= 10);
            }
        }
    }

    #[test]
    fn degenerate_limits_still_cover() {
        for total in 1..200u64 {
            for (min, max) in [(1, 4), (1, 1), (0, 3), (3, 7), (2, 2)] {
                let frames = plan(total, min, max);
                assert_covers(&frames, total, max.max(1));
            }
        }
    }
}
