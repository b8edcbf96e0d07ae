use thiserror::Error;

/// Capture-header present-word bits we walk. Later fields are skipped; an
/// extended bitmap (bit 31) chains additional words that we step over.
const F_TSFT: u32 = 1 << 0;
const F_FLAGS: u32 = 1 << 1;
const F_RATE: u32 = 1 << 2;
const F_CHANNEL: u32 = 1 << 3;
const F_FHSS: u32 = 1 << 4;
const F_DBM_ANTSIGNAL: u32 = 1 << 5;
const F_EXT: u32 = 1 << 31;

const MAX_PRESENT_WORDS: usize = 8;
const MAC_HEADER_LEN: usize = 24;
const MGMT_FIXED_LEN: usize = 12;

/// Structural validation failure. Malformed frames are counted and dropped
/// by the engine, never raised further.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported capture header version {0}")]
    UnsupportedVersion(u8),
    #[error("capture header length out of bounds")]
    HeaderLength,
    #[error("frame truncated inside a declared field")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Beacon,
    ProbeRequest,
    ProbeResponse,
    OtherManagement,
    Control,
    Data,
}

/// A structurally valid capture frame, reduced to what the engine tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    /// Transmitter address, lowercase colon-separated.
    pub identifier: String,
    pub kind: FrameKind,
    pub channel: Option<u8>,
    pub signal_dbm: Option<i8>,
    /// Advertised network name. `Some("")` is a hidden (zero-length) SSID;
    /// `None` means the frame carried no SSID element at all.
    pub ssid: Option<String>,
    /// Capability field for management frames, raw frame control otherwise.
    pub raw_flags: u16,
}

struct CaptureHeader {
    len: usize,
    channel: Option<u8>,
    signal_dbm: Option<i8>,
}

fn align(cursor: usize, to: usize) -> usize {
    (cursor + to - 1) / to * to
}

fn parse_capture_header(data: &[u8]) -> Result<CaptureHeader, FrameError> {
    if data.len() < 8 {
        return Err(FrameError::TooShort(data.len()));
    }
    if data[0] != 0 {
        return Err(FrameError::UnsupportedVersion(data[0]));
    }
    let len = u16::from_le_bytes([data[2], data[3]]) as usize;
    if len < 8 || len > data.len() {
        return Err(FrameError::HeaderLength);
    }

    let mut offset = 4;
    let mut words = Vec::new();
    loop {
        if offset + 4 > len {
            return Err(FrameError::HeaderLength);
        }
        let word = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        words.push(word);
        offset += 4;
        if word & F_EXT == 0 {
            break;
        }
        if words.len() >= MAX_PRESENT_WORDS {
            return Err(FrameError::HeaderLength);
        }
    }

    // walk only the first present word; vendor extensions don't carry the
    // fields we need
    let present = words[0];
    let mut cursor = offset;
    let mut channel = None;
    let mut signal_dbm = None;

    if present & F_TSFT != 0 {
        cursor = align(cursor, 8) + 8;
    }
    if present & F_FLAGS != 0 {
        cursor += 1;
    }
    if present & F_RATE != 0 {
        cursor += 1;
    }
    if present & F_CHANNEL != 0 {
        cursor = align(cursor, 2);
        if cursor + 4 > len {
            return Err(FrameError::Truncated);
        }
        let freq = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
        channel = freq_to_channel(freq);
        cursor += 4;
    }
    if present & F_FHSS != 0 {
        cursor += 2;
    }
    if present & F_DBM_ANTSIGNAL != 0 {
        if cursor + 1 > len {
            return Err(FrameError::Truncated);
        }
        signal_dbm = Some(data[cursor] as i8);
    }

    Ok(CaptureHeader {
        len,
        channel,
        signal_dbm,
    })
}

fn freq_to_channel(freq: u16) -> Option<u8> {
    match freq {
        2412..=2472 => Some(((freq - 2407) / 5) as u8),
        2484 => Some(14),
        5150..=5925 => Some(((freq - 5000) / 5) as u8),
        _ => None,
    }
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a raw capture frame: capture header, then the 802.11 MAC header,
/// then (for beacons and probe responses) the fixed fields and the SSID
/// element.
pub fn parse_frame(data: &[u8]) -> Result<ParsedFrame, FrameError> {
    let header = parse_capture_header(data)?;
    let body = &data[header.len..];
    if body.len() < MAC_HEADER_LEN {
        return Err(FrameError::TooShort(data.len()));
    }

    let frame_control = u16::from_le_bytes([body[0], body[1]]);
    let frame_type = (frame_control >> 2) & 0x3;
    let subtype = (frame_control >> 4) & 0xF;
    let identifier = format_mac(&body[10..16]);

    let kind = match (frame_type, subtype) {
        (0, 8) => FrameKind::Beacon,
        (0, 4) => FrameKind::ProbeRequest,
        (0, 5) => FrameKind::ProbeResponse,
        (0, _) => FrameKind::OtherManagement,
        (1, _) => FrameKind::Control,
        _ => FrameKind::Data,
    };

    let mut ssid = None;
    let mut raw_flags = frame_control;

    if matches!(kind, FrameKind::Beacon | FrameKind::ProbeResponse) {
        let fixed = &body[MAC_HEADER_LEN..];
        if fixed.len() < MGMT_FIXED_LEN {
            return Err(FrameError::Truncated);
        }
        // timestamp (8) + beacon interval (2) + capability (2)
        raw_flags = u16::from_le_bytes([fixed[10], fixed[11]]);

        let mut elements = &fixed[MGMT_FIXED_LEN..];
        while elements.len() >= 2 {
            let id = elements[0];
            let len = elements[1] as usize;
            if elements.len() < 2 + len {
                return Err(FrameError::Truncated);
            }
            if id == 0 {
                ssid = Some(String::from_utf8_lossy(&elements[2..2 + len]).into_owned());
                break;
            }
            elements = &elements[2 + len..];
        }
    }

    Ok(ParsedFrame {
        identifier,
        kind,
        channel: header.channel,
        signal_dbm: header.signal_dbm,
        ssid,
        raw_flags,
    })
}
