//! SMS-SUBMIT PDU encoder for modems driven in PDU mode (`AT+CMGF=0`).
//!
//! Only the UCS2 path is produced here. Plain ASCII bodies are sent in text mode
//! by the driver and never reach this module.
//!
//! A submitted frame looks like:
//!
//!   `00 | first-octet | TP-MR | addr-len | 91 | addr | 00 | 08 | UDL | [UDH] UD`
//!
//! where the leading `00` selects the SMSC stored on the SIM and is not counted in
//! the length passed to `AT+CMGS`.
//!
//! The encoder is total: it never validates numbers or text. Garbage in yields a
//! malformed PDU, which the modem will reject with `ERROR`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU8, Ordering};

/// Longest UCS2 text that fits one SMS.
pub const SINGLE_PART_CHARS: usize = 70;
/// UCS2 characters per segment once the 6-octet concatenation header is present.
pub const SEGMENT_CHARS: usize = 67;
/// Largest segment count the concatenation header can carry.
pub const MAX_SEGMENTS: usize = u8::MAX as usize;

/// Type-of-address for international numbers.
const TOA_INTERNATIONAL: &str = "91";
/// TP-PID 00, TP-DCS 08 (UCS2).
const PID_DCS_UCS2: &str = "0008";
/// SMS-SUBMIT, no validity period.
const FIRST_OCTET_SUBMIT: &str = "01";
/// SMS-SUBMIT with TP-UDHI set.
const FIRST_OCTET_SUBMIT_UDH: &str = "41";
/// Octets taken by `05 00 03 ref total index`.
const CONCAT_UDH_OCTETS: usize = 6;

/// Process-wide TP-Message-Reference counter.
///
/// Shared by every modem so concurrent multipart submissions never reuse a
/// reference before the 8-bit space wraps.
#[derive(Debug, Default)]
pub struct MessageReference(AtomicU8);

impl MessageReference {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Start the counter at `value`; the next call to [`next`](Self::next) returns `value + 1`.
    pub fn starting_at(value: u8) -> Self {
        Self(AtomicU8::new(value))
    }

    /// Advance and return the new reference, wrapping 255 -> 0.
    pub fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// True when `text` cannot go out in text mode (any multi-byte character present).
pub fn needs_ucs2(text: &str) -> bool {
    text.chars().count() != text.len()
}

/// Semi-octet encode a phone number: drop a leading `+`, pad odd lengths with `F`,
/// then swap every digit pair.
pub fn encode_phone_number(number: &str) -> String {
    let digits = number.strip_prefix('+').unwrap_or(number);
    let mut chars: Vec<char> = digits.chars().collect();
    if chars.len() % 2 != 0 {
        chars.push('F');
    }
    for pair in chars.chunks_mut(2) {
        pair.swap(0, 1);
    }
    chars.into_iter().collect()
}

/// Inverse of [`encode_phone_number`] (without the `+`).
pub fn decode_phone_number(encoded: &str) -> String {
    let mut chars: Vec<char> = encoded.chars().collect();
    for pair in chars.chunks_mut(2) {
        if pair.len() == 2 {
            pair.swap(0, 1);
        }
    }
    if chars.last() == Some(&'F') {
        chars.pop();
    }
    chars.into_iter().collect()
}

/// Hex dump of the UTF-16 code units of `text`, big endian.
pub fn encode_text_ucs2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 4);
    for unit in text.encode_utf16() {
        let _ = write!(&mut out, "{:04X}", unit);
    }
    out
}

/// Number of octets represented by a hex string, rounding a trailing nibble up.
pub fn hex_length_in_bytes(hex: &str) -> usize {
    hex.len().div_ceil(2)
}

fn destination_address(number: &str) -> String {
    let digits = number.strip_prefix('+').unwrap_or(number);
    format!(
        "{:02X}{}{}",
        digits.chars().count(),
        TOA_INTERNATIONAL,
        encode_phone_number(digits)
    )
}

/// TPDU (without SMSC prefix) for a UCS2 text of at most [`SINGLE_PART_CHARS`].
pub fn build_single_part_pdu(number: &str, text: &str) -> String {
    let user_data = encode_text_ucs2(text);
    format!(
        "{}00{}{}{:02X}{}",
        FIRST_OCTET_SUBMIT,
        destination_address(number),
        PID_DCS_UCS2,
        hex_length_in_bytes(&user_data),
        user_data
    )
}

/// `ceil(chars / 67)`.
pub fn segment_count(text: &str) -> usize {
    text.chars().count().div_ceil(SEGMENT_CHARS)
}

/// Split `text` into consecutive slices of [`SEGMENT_CHARS`] characters. The last
/// slice holds whatever remains.
pub fn split_segments(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(SEGMENT_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Concatenation header: IEI 00 (8-bit reference), 1-based `index`.
pub fn concat_udh(reference: u8, total: u8, index: u8) -> String {
    format!("050003{:02X}{:02X}{:02X}", reference, total, index)
}

/// One TPDU per segment, in segment order. `concat_ref` is shared by all segments of
/// this text; every segment draws its own TP-MR from `tpmr`.
///
/// `None` when the text needs more than [`MAX_SEGMENTS`] segments, which the 8-bit
/// header fields cannot number.
pub fn build_multipart_pdus(
    number: &str,
    text: &str,
    concat_ref: u8,
    tpmr: &MessageReference,
) -> Option<Vec<String>> {
    let total = u8::try_from(segment_count(text)).ok()?;
    let address = destination_address(number);
    let pdus = split_segments(text)
        .iter()
        .zip(1..=total)
        .map(|(segment, index)| {
            let user_data = encode_text_ucs2(segment);
            let udl = CONCAT_UDH_OCTETS + hex_length_in_bytes(&user_data);
            format!(
                "{}{:02X}{}{}{:02X}{}{}",
                FIRST_OCTET_SUBMIT_UDH,
                tpmr.next(),
                address,
                PID_DCS_UCS2,
                udl,
                concat_udh(concat_ref, total, index),
                user_data
            )
        })
        .collect();
    Some(pdus)
}

/// Frame a TPDU for the modem: default SMSC prefix in front.
pub fn with_default_smsc(tpdu: &str) -> String {
    format!("00{}", tpdu)
}
