//! Libre 2 cipher: BLE packet decryption, FRAM decryption and the streaming
//! unlock payload.
//!
//! Everything here is derived from a 16-bit Feistel-like mixing function
//! keyed by four constants and the sensor uid.

use log::{debug, warn};
use time::{Duration, OffsetDateTime};

use crate::codec::{crc16, read_bits, read_u16_le, word};
use crate::fram::{FRAM_LENGTH, HISTORY_INTERVAL_MINUTES};
use crate::glucose::{Glucose, GlucoseSource};
use crate::sensor::SensorType;

pub const BLE_PACKET_LENGTH: usize = 46;
/// Decrypted payload: the first two packet bytes are a clear nonce.
pub const BLE_PAYLOAD_LENGTH: usize = 44;
pub const UNLOCK_PAYLOAD_LENGTH: usize = 12;

const KEY: [u16; 4] = [0xA0C5, 0x6860, 0x0000, 0x14C6];
const BLE_SAMPLE_COUNT: usize = 10;
const BLE_TREND_OFFSETS: [i32; 7] = [0, 2, 4, 6, 7, 12, 15];
const BLE_WEAR_OFFSET: usize = 40;
const BLE_CRC_OFFSET: usize = 42;
const FRAM_BLOCK_LENGTH: usize = 8;
const US_14DAY_FIXED_ARG: u16 = 0xcadc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    UidLength(usize),
    PatchInfoLength(usize),
    PacketLength(usize),
    FramLength(usize),
}

impl core::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UidLength(len) => write!(f, "sensor uid must be 8 bytes, got {len}"),
            Self::PatchInfoLength(len) => {
                write!(f, "patch info must be at least 6 bytes, got {len}")
            }
            Self::PacketLength(len) => {
                write!(f, "expected a {BLE_PACKET_LENGTH}-byte BLE packet, got {len}")
            }
            Self::FramLength(len) => write!(f, "expected {FRAM_LENGTH} bytes of FRAM, got {len}"),
        }
    }
}

impl std::error::Error for DecryptError {}

type Uid = [u8; 8];

fn uid_array(uid: &[u8]) -> Result<Uid, DecryptError> {
    uid.try_into().map_err(|_| DecryptError::UidLength(uid.len()))
}

fn check_patch_info(patch_info: &[u8]) -> Result<(), DecryptError> {
    if patch_info.len() < 6 {
        return Err(DecryptError::PatchInfoLength(patch_info.len()));
    }
    Ok(())
}

fn op(value: u16) -> u16 {
    let mut res = value >> 2;
    if value & 1 != 0 {
        res ^= KEY[1];
    }
    if value & 2 != 0 {
        res ^= KEY[0];
    }
    res
}

pub fn process_crypto(input: [u16; 4]) -> [u16; 4] {
    let r0 = op(input[0]) ^ input[3];
    let r1 = op(r0) ^ input[2];
    let r2 = op(r1) ^ input[1];
    let r3 = op(r2) ^ input[0];
    let r4 = op(r3);
    let r5 = op(r4 ^ r0);
    let r6 = op(r5 ^ r1);
    let r7 = op(r6 ^ r2);
    [r3 ^ r7, r2 ^ r6, r1 ^ r5, r0 ^ r4]
}

pub fn prepare_variables(uid: &Uid, x: u16, y: u16) -> [u16; 4] {
    [
        word(uid[5], uid[4]).wrapping_add(x).wrapping_add(y),
        word(uid[3], uid[2]).wrapping_add(KEY[2]),
        word(uid[1], uid[0]).wrapping_add(x.wrapping_mul(2)),
        0x241a ^ KEY[3],
    ]
}

pub fn prepare_variables2(uid: &Uid, i1: u16, i2: u16, i3: u16, i4: u16) -> [u16; 4] {
    [
        word(uid[5], uid[4]).wrapping_add(i1),
        word(uid[3], uid[2]).wrapping_add(i2),
        word(uid[1], uid[0]).wrapping_add(i3).wrapping_add(KEY[2]),
        i4.wrapping_add(KEY[3]),
    ]
}

pub fn useful_function(uid: &Uid, x: u16, y: u16) -> [u8; 4] {
    let block_key = process_crypto(prepare_variables(uid, x, y));
    let low = (block_key[0] ^ 0x4163).to_le_bytes();
    let high = (block_key[1] ^ 0x4344).to_le_bytes();
    [low[0], low[1], high[0], high[1]]
}

fn push_words(out: &mut Vec<u8>, words: [u16; 4]) {
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
}

/// Decrypts a 46-byte streamed packet into its 44-byte payload.
///
/// The payload CRC is not checked here; see [`parse_ble_data`].
pub fn decrypt_ble(uid: &[u8], packet: &[u8]) -> Result<Vec<u8>, DecryptError> {
    let uid = uid_array(uid)?;
    if packet.len() != BLE_PACKET_LENGTH {
        return Err(DecryptError::PacketLength(packet.len()));
    }

    let d = useful_function(&uid, 0x1b, 0x1b6a);
    let x = (word(d[1], d[0]) ^ word(d[3], d[2])) | 0x63;
    let y = word(packet[1], packet[0]) ^ 0x63;

    let mut key = Vec::with_capacity(64);
    let mut block = process_crypto(prepare_variables(&uid, x, y));
    for _ in 0..8 {
        push_words(&mut key, block);
        block = process_crypto(block);
    }

    Ok(packet[2..]
        .iter()
        .zip(&key)
        .map(|(byte, k)| byte ^ k)
        .collect())
}

/// Decrypts a memory image read from an encrypted generation.
///
/// Other generations are returned unchanged.
pub fn decrypt_fram(
    sensor_type: SensorType,
    uid: &[u8],
    patch_info: &[u8],
    fram: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    if fram.len() != FRAM_LENGTH {
        return Err(DecryptError::FramLength(fram.len()));
    }
    if !sensor_type.has_encrypted_fram() {
        return Ok(fram.to_vec());
    }
    let uid = uid_array(uid)?;
    check_patch_info(patch_info)?;

    let info_word = word(patch_info[5], patch_info[4]);
    let block_count = FRAM_LENGTH / FRAM_BLOCK_LENGTH;
    let mut result = Vec::with_capacity(FRAM_LENGTH);

    for (i, chunk) in fram.chunks_exact(FRAM_BLOCK_LENGTH).enumerate() {
        let y = match sensor_type {
            SensorType::LibreUS14day if i < 3 || i >= block_count - 3 => US_14DAY_FIXED_ARG,
            SensorType::LibreUS14day => info_word,
            _ => info_word ^ 0x44,
        };
        let mut key = Vec::with_capacity(FRAM_BLOCK_LENGTH);
        push_words(&mut key, process_crypto(prepare_variables(&uid, i as u16, y)));
        result.extend(chunk.iter().zip(&key).map(|(byte, k)| byte ^ k));
    }

    Ok(result)
}

/// 12-byte login payload that makes a Libre 2 start streaming.
///
/// `unlock_count` must grow across connections; the sensor rejects a
/// payload derived from a time it has already seen.
pub fn streaming_unlock_payload(
    uid: &[u8],
    patch_info: &[u8],
    activation_time: u32,
    unlock_count: u16,
) -> Result<[u8; UNLOCK_PAYLOAD_LENGTH], DecryptError> {
    let uid = uid_array(uid)?;
    check_patch_info(patch_info)?;

    let time = activation_time.wrapping_add(u32::from(unlock_count));
    let b = time.to_le_bytes();
    let ad = useful_function(&uid, 0x1b, 0x1b6a);
    let ed = useful_function(
        &uid,
        0x1e,
        (activation_time as u16) ^ word(patch_info[5], patch_info[4]),
    );

    let t11 = word(ed[1], ed[0]) ^ word(b[3], b[2]);
    let t12 = word(ad[1], ad[0]);
    let t13 = word(ed[3], ed[2]) ^ word(b[1], b[0]);
    let t14 = word(ad[3], ad[2]);
    let t2 = process_crypto(prepare_variables2(&uid, t11, t12, t13, t14));

    let [t20, t21] = t2[0].to_le_bytes();
    let [t22, t23] = t2[1].to_le_bytes();
    let [t24, t25] = t2[2].to_le_bytes();
    let [t26, t27] = t2[3].to_le_bytes();
    let t31 = crc16(&[0xc1, 0xc4, 0xc3, 0xc0, 0xd4, 0xe1, 0xe7, 0xba, t20, t21]).swap_bytes();
    let t32 = crc16(&[t22, t23, t24, t25, t26, t27]).swap_bytes();
    let t33 = crc16(&[ad[0], ad[1], ad[2], ad[3], ed[0], ed[1]]).swap_bytes();
    let t34 = crc16(&[ed[2], ed[3], b[0], b[1], b[2], b[3]]).swap_bytes();
    let t4 = process_crypto(prepare_variables2(&uid, t31, t32, t33, t34));

    let mut payload = [0_u8; UNLOCK_PAYLOAD_LENGTH];
    payload[..4].copy_from_slice(&b);
    for (i, w) in t4.iter().enumerate() {
        payload[4 + i * 2..6 + i * 2].copy_from_slice(&w.to_le_bytes());
    }
    Ok(payload)
}

/// Samples carried by one decrypted BLE payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BleReading {
    /// Sensor age in minutes.
    pub wear_time: u32,
    pub crc_ok: bool,
    /// Most recent first.
    pub trend: Vec<Glucose>,
    /// Most recent first, fifteen minutes apart.
    pub history: Vec<Glucose>,
}

/// Unpacks the ten samples of a decrypted payload.
///
/// A CRC mismatch is logged and reported in [`BleReading::crc_ok`] but does
/// not reject the payload.
pub fn parse_ble_data(
    payload: &[u8],
    read_at: OffsetDateTime,
    history_delay: u32,
) -> Result<BleReading, DecryptError> {
    if payload.len() != BLE_PAYLOAD_LENGTH {
        return Err(DecryptError::PacketLength(payload.len()));
    }

    let stored = read_u16_le(payload, BLE_CRC_OFFSET);
    let computed = crc16(&payload[..BLE_CRC_OFFSET]);
    let crc_ok = stored == computed;
    if !crc_ok {
        warn!("BLE payload CRC16: {stored:04x}, computed: {computed:04x}");
    }

    let wear_time = u32::from(read_u16_le(payload, BLE_WEAR_OFFSET));
    let wear = wear_time as i32;
    let history_base = (wear - history_delay as i32).div_euclid(HISTORY_INTERVAL_MINUTES)
        * HISTORY_INTERVAL_MINUTES;

    let mut trend = Vec::with_capacity(BLE_TREND_OFFSETS.len());
    let mut history = Vec::with_capacity(BLE_SAMPLE_COUNT - BLE_TREND_OFFSETS.len());
    for i in 0..BLE_SAMPLE_COUNT {
        let id = match BLE_TREND_OFFSETS.get(i) {
            Some(offset) => wear - offset,
            None => {
                history_base - HISTORY_INTERVAL_MINUTES * (i - BLE_TREND_OFFSETS.len()) as i32
            }
        };
        let sample = decode_ble_sample(
            payload,
            i * 4,
            id,
            read_at - Duration::minutes(i64::from(wear - id)),
        );
        if i < BLE_TREND_OFFSETS.len() {
            trend.push(sample);
        } else {
            history.push(sample);
        }
    }

    debug!(
        "BLE payload: wear time {wear_time} min, {} trend, {} history",
        trend.len(),
        history.len()
    );

    Ok(BleReading {
        wear_time,
        crc_ok,
        trend,
        history,
    })
}

fn decode_ble_sample(payload: &[u8], offset: usize, id: i32, date: OffsetDateTime) -> Glucose {
    let raw = read_bits(payload, offset, 0, 0xe);
    let raw_temperature = read_bits(payload, offset, 0xe, 0xc) << 2;
    let mut temperature_adjustment = (read_bits(payload, offset, 0x1a, 0x5) << 2) as i32;
    if read_bits(payload, offset, 0x1f, 0x1) != 0 {
        temperature_adjustment = -temperature_adjustment;
    }
    Glucose::raw(
        id,
        date,
        raw,
        raw_temperature,
        temperature_adjustment,
        GlucoseSource::Ble,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use time::Duration;

    use super::{
        BLE_PAYLOAD_LENGTH, DecryptError, decrypt_ble, decrypt_fram, parse_ble_data,
        streaming_unlock_payload, useful_function,
    };
    use crate::codec::from_hex;
    use crate::fram::tests::READ_DATE;
    use crate::sensor::SensorType;

    pub(crate) const UID: [u8; 8] = [0x2f, 0xe7, 0xb1, 0x00, 0x00, 0xa4, 0x07, 0xe0];
    pub(crate) const PATCH_INFO: [u8; 6] = [0x9D, 0x08, 0x30, 0x01, 0x76, 0x25];

    pub(crate) const PACKET: &str = "5a1368dba8a9e84bcf0faff1fd531267ec00cf99d05004f6d9860133a15814e8689a41fdab7f64a448f4c36863f7";
    const PLAINTEXT: &str = "dc057701e6457785f0857709fac5778d040678110e4678951886781922c6789d2c067921364679a5e110265f";

    pub(crate) fn packet() -> Vec<u8> {
        from_hex(PACKET).expect("packet hex")
    }

    fn plaintext() -> Vec<u8> {
        from_hex(PLAINTEXT).expect("plaintext hex")
    }

    #[test]
    fn useful_function_vector() {
        assert_eq!(useful_function(&UID, 0x1b, 0x1b6a), [0x18, 0xdf, 0x7c, 0x40]);
    }

    #[test]
    fn decrypts_ble_packet() {
        let payload = decrypt_ble(&UID, &packet()).expect("decrypt");
        assert_eq!(payload.len(), BLE_PAYLOAD_LENGTH);
        assert_eq!(payload, plaintext());
    }

    #[test]
    fn rejects_bad_lengths() {
        assert_eq!(decrypt_ble(&UID[..7], &packet()), Err(DecryptError::UidLength(7)));
        assert_eq!(
            decrypt_ble(&UID, &packet()[..45]),
            Err(DecryptError::PacketLength(45))
        );
    }

    #[test]
    fn parses_decrypted_samples() {
        let reading = parse_ble_data(&plaintext(), READ_DATE, 2).expect("parse");
        assert!(reading.crc_ok);
        assert_eq!(reading.wear_time, 4321);
        assert_eq!(reading.trend.len(), 7);
        assert_eq!(reading.history.len(), 3);

        let trend_ids: Vec<i32> = reading.trend.iter().map(|g| g.id).collect();
        assert_eq!(trend_ids, [4321, 4319, 4317, 4315, 4314, 4309, 4306]);
        assert_eq!(reading.trend[1].date, READ_DATE - Duration::minutes(2));

        // (4321 - 2) rounded down to 15 minutes is 4305.
        let history_ids: Vec<i32> = reading.history.iter().map(|g| g.id).collect();
        assert_eq!(history_ids, [4305, 4290, 4275]);
        assert_eq!(reading.history[0].date, READ_DATE - Duration::minutes(16));

        let samples = reading.trend.iter().chain(&reading.history);
        for (i, sample) in samples.enumerate() {
            let sign = if i % 2 == 0 { 1 } else { -1 };
            assert_eq!(sample.raw, 1500 + 10 * i as u32);
            assert_eq!(sample.raw_temperature, 6000 + 4 * i as u32);
            assert_eq!(sample.temperature_adjustment, sign * 4 * i as i32);
        }
    }

    #[test]
    fn corrupt_payload_crc_is_not_fatal() {
        let mut payload = plaintext();
        payload[5] ^= 0x10;
        let reading = parse_ble_data(&payload, READ_DATE, 2).expect("parse");
        assert!(!reading.crc_ok);
        assert_eq!(reading.trend.len(), 7);
    }

    #[test]
    fn fram_keys_per_generation() {
        let zeros = vec![0_u8; 344];

        let libre2 = decrypt_fram(SensorType::Libre2, &UID, &PATCH_INFO, &zeros).expect("decrypt");
        assert_eq!(libre2[..8], from_hex("c5564875bfd11578").expect("hex")[..]);
        assert_eq!(libre2[336..], from_hex("17456ab9fe4b6930").expect("hex")[..]);

        let us_info = [0xE5, 0x00, 0x03, 0x02, 0x76, 0x25];
        let us = decrypt_fram(SensorType::LibreUS14day, &UID, &us_info, &zeros).expect("decrypt");
        assert_eq!(us[..8], from_hex("019d06e41b953a42").expect("hex")[..]);
        assert_eq!(us[80..88], from_hex("3d3e29c51bd3dcd3").expect("hex")[..]);

        let twice = decrypt_fram(SensorType::Libre2, &UID, &PATCH_INFO, &libre2).expect("decrypt");
        assert_eq!(twice, zeros);
    }

    #[test]
    fn plain_generations_pass_through() {
        let fram: Vec<u8> = (0..344).map(|i| i as u8).collect();
        let out = decrypt_fram(SensorType::Libre1, &[], &[], &fram).expect("pass through");
        assert_eq!(out, fram);
        assert_eq!(
            decrypt_fram(SensorType::Libre2, &UID, &PATCH_INFO, &fram[..100]),
            Err(DecryptError::FramLength(100))
        );
    }

    #[test]
    fn unlock_payload_vector() {
        let payload =
            streaming_unlock_payload(&UID, &PATCH_INFO, 1_600_000_000, 3).expect("payload");
        assert_eq!(payload.to_vec(), from_hex("03105e5f3634ef1d088c6060").expect("hex"));
        assert_ne!(
            streaming_unlock_payload(&UID, &PATCH_INFO, 1_600_000_000, 4).expect("payload"),
            payload
        );
    }
}
