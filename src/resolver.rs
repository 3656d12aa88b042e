use crate::config::{BoardConfig, BoardRevision};
use crate::error::GpioError;
use crate::gpio::{Channel, NumberingMode};

/// Maps a caller-supplied channel number to a line identity.
pub trait PinResolver: Send + Sync {
    fn resolve(&self, raw_id: u32, mode: NumberingMode) -> Result<Channel, GpioError>;
}

const NC: Option<u32> = None;

// Indexed by physical pin number minus one.
#[rustfmt::skip]
const HEADER_REV1: [Option<u32>; 26] = [
    NC, NC, Some(0), NC, Some(1), NC, Some(4), Some(14), NC, Some(15),
    Some(17), Some(18), Some(21), NC, Some(22), Some(23), NC, Some(24), Some(10), NC,
    Some(9), Some(25), Some(11), Some(8), NC, Some(7),
];

#[rustfmt::skip]
const HEADER_REV2: [Option<u32>; 26] = [
    NC, NC, Some(2), NC, Some(3), NC, Some(4), Some(14), NC, Some(15),
    Some(17), Some(18), Some(27), NC, Some(22), Some(23), NC, Some(24), Some(10), NC,
    Some(9), Some(25), Some(11), Some(8), NC, Some(7),
];

#[rustfmt::skip]
const HEADER_PLUS: [Option<u32>; 40] = [
    NC, NC, Some(2), NC, Some(3), NC, Some(4), Some(14), NC, Some(15),
    Some(17), Some(18), Some(27), NC, Some(22), Some(23), NC, Some(24), Some(10), NC,
    Some(9), Some(25), Some(11), Some(8), NC, Some(7), Some(0), Some(1), Some(5), NC,
    Some(6), Some(12), Some(13), NC, Some(19), Some(16), Some(26), Some(20), NC, Some(21),
];

const BCM_MAX_LINE: u32 = 53;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardLayout {
    header: Vec<Option<u32>>,
    max_line: u32,
}

impl BoardLayout {
    pub fn new(header: Vec<Option<u32>>, max_line: u32) -> Self {
        Self { header, max_line }
    }

    pub fn revision(revision: BoardRevision) -> Self {
        let header = match revision {
            BoardRevision::Rev1 => HEADER_REV1.to_vec(),
            BoardRevision::Rev2 => HEADER_REV2.to_vec(),
            BoardRevision::Plus => HEADER_PLUS.to_vec(),
        };
        Self::new(header, BCM_MAX_LINE)
    }

    pub fn from_config(config: &BoardConfig) -> Self {
        match config {
            BoardConfig::Revision(revision) => Self::revision(*revision),
            BoardConfig::Custom { header, max_line } => Self::new(header.clone(), *max_line),
        }
    }

    pub fn pin_count(&self) -> usize {
        self.header.len()
    }
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self::revision(BoardRevision::default())
    }
}

impl PinResolver for BoardLayout {
    fn resolve(&self, raw_id: u32, mode: NumberingMode) -> Result<Channel, GpioError> {
        let line = match mode {
            NumberingMode::Board => raw_id
                .checked_sub(1)
                .and_then(|index| self.header.get(index as usize).copied().flatten()),
            NumberingMode::Bcm => (raw_id <= self.max_line).then_some(raw_id),
        };

        line.map(Channel::from_line).ok_or_else(|| {
            GpioError::InvalidChannel(format!("{raw_id} ({mode:?} numbering)"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_pins_map_through_header() {
        let layout = BoardLayout::default();
        assert_eq!(
            layout.resolve(12, NumberingMode::Board).unwrap(),
            Channel::from_line(18)
        );
        assert_eq!(
            layout.resolve(40, NumberingMode::Board).unwrap(),
            Channel::from_line(21)
        );
        assert_eq!(layout.pin_count(), 40);
    }

    #[test]
    fn power_and_out_of_range_pins_are_invalid() {
        let layout = BoardLayout::default();
        for raw in [0, 1, 6, 41] {
            assert!(matches!(
                layout.resolve(raw, NumberingMode::Board),
                Err(GpioError::InvalidChannel(_))
            ));
        }
        assert!(layout.resolve(54, NumberingMode::Bcm).is_err());
        assert_eq!(
            layout.resolve(53, NumberingMode::Bcm).unwrap(),
            Channel::from_line(53)
        );
    }

    #[test]
    fn revisions_differ_on_i2c_pins() {
        let rev1 = BoardLayout::revision(BoardRevision::Rev1);
        let rev2 = BoardLayout::revision(BoardRevision::Rev2);
        assert_eq!(rev1.resolve(3, NumberingMode::Board).unwrap().line(), 0);
        assert_eq!(rev2.resolve(3, NumberingMode::Board).unwrap().line(), 2);
        assert!(rev2.resolve(27, NumberingMode::Board).is_err());
    }
}
