//! Decoding of the 344-byte sensor memory image.
//!
//! Layout:
//! - header `[0..24)`: CRC at 0, sensor state at 4
//! - body `[24..320)`: CRC at 24, trend head at 26, history head at 27,
//!   16 trend slots from 28, 32 history slots from 124, age at 316
//! - footer `[320..344)`: CRC at 320, calibration data from 336

use log::{debug, warn};
use time::{Duration, OffsetDateTime};

use crate::codec::{crc16, read_bits, read_u16_le, write_bits};
use crate::glucose::{Glucose, GlucoseSource};
use crate::sensor::SensorState;

pub const FRAM_LENGTH: usize = 344;
pub const TREND_SLOTS: usize = 16;
pub const HISTORY_SLOTS: usize = 32;
pub const SLOT_LENGTH: usize = 6;
pub const HISTORY_INTERVAL_MINUTES: i32 = 15;

const STATE_OFFSET: usize = 4;
const TREND_INDEX_OFFSET: usize = 26;
const HISTORY_INDEX_OFFSET: usize = 27;
const TREND_BASE: usize = 28;
const HISTORY_BASE: usize = 124;
const AGE_OFFSET: usize = 316;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcRegion {
    pub name: &'static str,
    pub crc_offset: usize,
    pub start: usize,
    pub end: usize,
}

pub const HEADER: CrcRegion = CrcRegion {
    name: "header",
    crc_offset: 0,
    start: 2,
    end: 24,
};
pub const BODY: CrcRegion = CrcRegion {
    name: "body",
    crc_offset: 24,
    start: 26,
    end: 320,
};
pub const FOOTER: CrcRegion = CrcRegion {
    name: "footer",
    crc_offset: 320,
    start: 322,
    end: 344,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionCrc {
    pub region: CrcRegion,
    pub stored: u16,
    pub computed: u16,
}

impl RegionCrc {
    fn check(fram: &[u8], region: CrcRegion) -> Self {
        Self {
            region,
            stored: read_u16_le(fram, region.crc_offset),
            computed: crc16(&fram[region.start..region.end]),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.stored == self.computed
    }
}

impl core::fmt::Display for RegionCrc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} CRC16: {:04x}, computed: {:04x} -> {}",
            self.region.name,
            self.stored,
            self.computed,
            if self.is_ok() { "OK" } else { "FAILED" }
        )
    }
}

/// Independent CRC status of the three memory regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcReport {
    pub header: RegionCrc,
    pub body: RegionCrc,
    pub footer: RegionCrc,
}

impl CrcReport {
    pub fn all_ok(&self) -> bool {
        self.header.is_ok() && self.body.is_ok() && self.footer.is_ok()
    }
}

impl core::fmt::Display for CrcReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}; {}; {}", self.header, self.body, self.footer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramError {
    Length(usize),
    /// The body failed its CRC. Earlier readings, if any, are kept.
    BodyCrc { stored: u16, computed: u16 },
}

impl core::fmt::Display for FramError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Length(len) => write!(f, "expected {FRAM_LENGTH} bytes of FRAM, got {len}"),
            Self::BodyCrc { stored, computed } => write!(
                f,
                "could not validate sensor data: body CRC {stored:04x} != {computed:04x}"
            ),
        }
    }
}

impl std::error::Error for FramError {}

pub fn crc_report(fram: &[u8]) -> Result<CrcReport, FramError> {
    if fram.len() != FRAM_LENGTH {
        return Err(FramError::Length(fram.len()));
    }

    Ok(CrcReport {
        header: RegionCrc::check(fram, HEADER),
        body: RegionCrc::check(fram, BODY),
        footer: RegionCrc::check(fram, FOOTER),
    })
}

/// Rewrites the three stored CRCs so they match the region contents.
pub fn seal(fram: &mut [u8]) -> Result<(), FramError> {
    if fram.len() != FRAM_LENGTH {
        return Err(FramError::Length(fram.len()));
    }

    for region in [HEADER, BODY, FOOTER] {
        let crc = crc16(&fram[region.start..region.end]);
        fram[region.crc_offset..region.crc_offset + 2].copy_from_slice(&crc.to_le_bytes());
    }
    Ok(())
}

/// Everything the trend and history rings yield.
#[derive(Debug, Clone, PartialEq)]
pub struct FramContents {
    pub state: Option<SensorState>,
    pub age: u32,
    pub trend_index: usize,
    pub history_index: usize,
    /// Most recent first, one minute apart.
    pub trend: Vec<Glucose>,
    /// Most recent first, fifteen minutes apart.
    pub history: Vec<Glucose>,
}

/// Minutes between the last reading and the most recent history slot.
///
/// The sensor commits a history slot `write_delay` minutes after each
/// 15-minute boundary. If the stored head matches the slot expected from the
/// age, the newest entry is `delay` minutes old; otherwise the commit has not
/// landed yet and the newest entry is one slot older.
pub fn history_anchor_minutes(age: u32, history_index: usize, write_delay: u32) -> i32 {
    let age = age as i32;
    let write_delay = write_delay as i32;
    let since_delay = (age - write_delay).max(0);
    let precise_index = (since_delay / HISTORY_INTERVAL_MINUTES) as usize % HISTORY_SLOTS;
    let delay = since_delay % HISTORY_INTERVAL_MINUTES + write_delay;

    if precise_index == history_index {
        delay
    } else {
        delay + HISTORY_INTERVAL_MINUTES
    }
}

/// Decodes both rings. Pure: the same image and date give the same output.
pub fn decode(
    fram: &[u8],
    last_reading_date: OffsetDateTime,
    write_delay: u32,
) -> Result<FramContents, FramError> {
    if fram.len() != FRAM_LENGTH {
        return Err(FramError::Length(fram.len()));
    }

    let state = match SensorState::try_from(fram[STATE_OFFSET]) {
        Ok(state) => Some(state),
        Err(_) => {
            warn!("unknown sensor state byte 0x{:02x}", fram[STATE_OFFSET]);
            None
        }
    };
    let age = u32::from(read_u16_le(fram, AGE_OFFSET));
    let trend_index = usize::from(fram[TREND_INDEX_OFFSET]) % TREND_SLOTS;
    let history_index = usize::from(fram[HISTORY_INDEX_OFFSET]) % HISTORY_SLOTS;

    let trend = (0..TREND_SLOTS)
        .map(|i| {
            let j = (trend_index + TREND_SLOTS - 1 - i) % TREND_SLOTS;
            let minutes = i as i32;
            decode_slot(
                fram,
                TREND_BASE + j * SLOT_LENGTH,
                age as i32 - minutes,
                last_reading_date - Duration::minutes(i64::from(minutes)),
            )
        })
        .collect();

    let anchor = history_anchor_minutes(age, history_index, write_delay);
    let history = (0..HISTORY_SLOTS)
        .map(|i| {
            let j = (history_index + HISTORY_SLOTS - 1 - i) % HISTORY_SLOTS;
            let minutes = anchor + i as i32 * HISTORY_INTERVAL_MINUTES;
            decode_slot(
                fram,
                HISTORY_BASE + j * SLOT_LENGTH,
                age as i32 - minutes,
                last_reading_date - Duration::minutes(i64::from(minutes)),
            )
        })
        .collect();

    debug!(
        "decoded FRAM: age {age} min, trend head {trend_index}, history head {history_index}, history anchor -{anchor} min"
    );

    Ok(FramContents {
        state,
        age,
        trend_index,
        history_index,
        trend,
        history,
    })
}

fn decode_slot(fram: &[u8], offset: usize, id: i32, date: OffsetDateTime) -> Glucose {
    let raw = read_bits(fram, offset, 0, 0xe);
    let quality = read_bits(fram, offset, 0xe, 0xb);
    let has_error = read_bits(fram, offset, 0x19, 0x1) != 0;
    let raw_temperature = read_bits(fram, offset, 0x1a, 0xc) << 2;
    let mut temperature_adjustment = (read_bits(fram, offset, 0x26, 0x9) << 2) as i32;
    if read_bits(fram, offset, 0x2f, 0x1) != 0 {
        temperature_adjustment = -temperature_adjustment;
    }

    Glucose {
        has_error,
        data_quality: (quality & 0x1FF) as u16,
        data_quality_flags: ((quality & 0x600) >> 9) as u8,
        ..Glucose::raw(
            id,
            date,
            raw,
            raw_temperature,
            temperature_adjustment,
            GlucoseSource::Fram,
        )
    }
}

/// Packs one slot the way the sensor does.
pub fn encode_slot(
    fram: &mut [u8],
    offset: usize,
    raw: u32,
    raw_temperature: u32,
    temperature_adjustment: i32,
) {
    write_bits(fram, offset, 0, 0xe, raw);
    write_bits(fram, offset, 0x1a, 0xc, raw_temperature >> 2);
    write_bits(fram, offset, 0x26, 0x9, temperature_adjustment.unsigned_abs() >> 2);
    write_bits(fram, offset, 0x2f, 0x1, u32::from(temperature_adjustment < 0));
}

#[cfg(test)]
pub(crate) mod tests {
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    use super::{
        BODY, FOOTER, FRAM_LENGTH, FramError, HEADER, HISTORY_BASE, TREND_BASE, crc_report,
        decode, encode_slot, history_anchor_minutes, seal,
    };
    use crate::sensor::SensorState;

    pub(crate) const READ_DATE: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

    pub(crate) fn trend_raw(slot: usize) -> u32 {
        1000 + slot as u32 * 10
    }

    pub(crate) fn history_raw(slot: usize) -> u32 {
        2000 + slot as u32 * 7
    }

    /// Active sensor, 3 days old (4320 min), trend head 5, history head 31.
    pub(crate) fn golden_fram() -> Vec<u8> {
        let mut fram = vec![0_u8; FRAM_LENGTH];
        fram[4] = 0x03;
        fram[26] = 5;
        fram[27] = 31;
        fram[316..318].copy_from_slice(&4320_u16.to_le_bytes());
        for slot in 0..16 {
            encode_slot(&mut fram, TREND_BASE + slot * 6, trend_raw(slot), 6400 + slot as u32 * 4, -8);
        }
        for slot in 0..32 {
            encode_slot(&mut fram, HISTORY_BASE + slot * 6, history_raw(slot), 7000, 12);
        }
        seal(&mut fram).expect("fram length");
        fram
    }

    #[test]
    fn sealed_fram_reports_all_ok() {
        let report = crc_report(&golden_fram()).expect("fram length");
        assert!(report.all_ok(), "{report}");
    }

    #[test]
    fn single_byte_flip_fails_only_its_region() {
        for (region, byte) in [(HEADER, 10), (BODY, 200), (FOOTER, 330)] {
            let mut fram = golden_fram();
            fram[byte] ^= 0x01;
            let report = crc_report(&fram).expect("fram length");
            assert_eq!(report.header.is_ok(), region != HEADER);
            assert_eq!(report.body.is_ok(), region != BODY);
            assert_eq!(report.footer.is_ok(), region != FOOTER);
        }
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(crc_report(&[0; 100]), Err(FramError::Length(100)));
        assert!(decode(&[0; 345], READ_DATE, 3).is_err());
    }

    #[test]
    fn decodes_golden_trend_and_history() {
        let contents = decode(&golden_fram(), READ_DATE, 3).expect("decode");
        assert_eq!(contents.state, Some(SensorState::Ready));
        assert_eq!(contents.age, 4320);

        // Walking back from head 5: slots 4, 3, 2, 1, 0, 15, 14, ...
        let expected_trend: Vec<u32> = (0..16).map(|i| trend_raw((5 + 16 - 1 - i) % 16)).collect();
        let trend: Vec<u32> = contents.trend.iter().map(|g| g.raw).collect();
        assert_eq!(trend, expected_trend);
        assert_eq!(contents.trend[0].id, 4320);
        assert_eq!(contents.trend[15].id, 4305);
        assert_eq!(contents.trend[0].date, READ_DATE);
        assert_eq!(contents.trend[0].raw_temperature, 6400 + 4 * 4);
        assert_eq!(contents.trend[0].temperature_adjustment, -8);

        let expected_history: Vec<u32> =
            (0..32).map(|i| history_raw((31 + 32 - 1 - i) % 32)).collect();
        let history: Vec<u32> = contents.history.iter().map(|g| g.raw).collect();
        assert_eq!(history, expected_history);
        assert_eq!(contents.history[0].temperature_adjustment, 12);
    }

    #[test]
    fn history_timestamps_follow_write_delay() {
        // age 4320: (4317 / 15) % 32 = 287 % 32 = 31 == head, delay = 12 + 3.
        let contents = decode(&golden_fram(), READ_DATE, 3).expect("decode");
        assert_eq!(contents.history[0].id, 4320 - 15);
        assert_eq!(contents.history[0].date, READ_DATE - Duration::minutes(15));
        assert_eq!(contents.history[1].id, 4320 - 30);
        assert!(contents.history.windows(2).all(|w| w[0].id - w[1].id == 15));
    }

    #[test]
    fn history_anchor_shifts_one_slot_when_head_lags() {
        assert_eq!(history_anchor_minutes(4320, 31, 3), 15);
        assert_eq!(history_anchor_minutes(4320, 30, 3), 30);
        assert_eq!(history_anchor_minutes(4324, 0, 3), 4);
        assert_eq!(history_anchor_minutes(2, 0, 3), 3);
    }

    #[test]
    fn decode_is_idempotent() {
        let fram = golden_fram();
        let first = decode(&fram, READ_DATE, 3).expect("decode");
        let second = decode(&fram, READ_DATE, 3).expect("decode");
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_state_byte_is_ignored() {
        let mut fram = golden_fram();
        fram[4] = 0x42;
        seal(&mut fram).expect("fram length");
        let contents = decode(&fram, READ_DATE, 3).expect("decode");
        assert_eq!(contents.state, None);
    }
}
