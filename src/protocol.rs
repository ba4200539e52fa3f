use crate::error::{ErgZoneError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// First byte of every control-point response frame
pub const RESPONSE_CODE: u8 = 0x80;

/// Length of a control-point response frame
pub const RESPONSE_SIZE: usize = 3;

/// Fitness Machine Control Point opcodes used by the zone controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlOpcode {
    /// Ask the trainer to accept commands from this client
    RequestControl = 0x00,
    /// Reset the trainer's control state
    Reset = 0x01,
    /// ERG mode target power, signed 16-bit watts
    SetTargetPower = 0x05,
    /// Start or resume training
    StartOrResume = 0x07,
    /// Stop or pause training, followed by one sub-command byte
    StopOrPause = 0x08,
}

impl ControlOpcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x05 => Some(Self::SetTargetPower),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            _ => None,
        }
    }
}

impl fmt::Display for ControlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestControl => write!(f, "request-control"),
            Self::Reset => write!(f, "reset"),
            Self::SetTargetPower => write!(f, "set-target-power"),
            Self::StartOrResume => write!(f, "start-or-resume"),
            Self::StopOrPause => write!(f, "stop-or-pause"),
        }
    }
}

/// Sub-command byte of [`ControlOpcode::StopOrPause`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopKind {
    /// End training
    Stop = 0x01,
    /// Pause training
    Pause = 0x02,
}

/// Control-point result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Command accepted
    Success,
    /// Opcode not supported by this trainer
    NotSupported,
    /// Parameter out of range
    InvalidParameter,
    /// Trainer could not carry out the command
    OperationFailed,
    /// Control has not been granted to this client
    ControlNotPermitted,
    /// Anything else, kept verbatim
    Unknown(u8),
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::NotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::NotSupported => write!(f, "Op Code Not Supported"),
            Self::InvalidParameter => write!(f, "Invalid Parameter"),
            Self::OperationFailed => write!(f, "Operation Failed"),
            Self::ControlNotPermitted => write!(f, "Control Not Permitted"),
            Self::Unknown(code) => write!(f, "Unknown ({code:#04X})"),
        }
    }
}

/// A command written to the control point
///
/// Every command is fire-and-confirm: the trainer answers with exactly one
/// [`ControlResponse`] echoing the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Request control
    RequestControl,
    /// Reset
    Reset,
    /// Set ERG target power in watts
    SetTargetPower(i16),
    /// Start or resume
    StartOrResume,
    /// Stop or pause
    StopOrPause(StopKind),
}

impl ControlCommand {
    /// Opcode of this command
    #[must_use]
    pub const fn opcode(&self) -> ControlOpcode {
        match self {
            Self::RequestControl => ControlOpcode::RequestControl,
            Self::Reset => ControlOpcode::Reset,
            Self::SetTargetPower(_) => ControlOpcode::SetTargetPower,
            Self::StartOrResume => ControlOpcode::StartOrResume,
            Self::StopOrPause(_) => ControlOpcode::StopOrPause,
        }
    }

    /// Serialize to control-point bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(self.opcode() as u8);
        match self {
            Self::SetTargetPower(watts) => buf.put_i16_le(*watts),
            Self::StopOrPause(kind) => buf.put_u8(*kind as u8),
            Self::RequestControl | Self::Reset | Self::StartOrResume => {}
        }
        buf.freeze()
    }
}

/// A control-point response frame: `[0x80, echoed opcode, result code]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    /// Echoed request opcode, raw
    pub opcode: u8,
    /// Result code, raw
    pub result_code: u8,
}

impl ControlResponse {
    /// Parse a response frame
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::ParseError`] if the frame is shorter than three
    /// bytes or does not start with the response code.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RESPONSE_SIZE {
            return Err(ErgZoneError::ParseError(format!(
                "Response too short: {} bytes, expected {RESPONSE_SIZE}",
                data.len()
            )));
        }

        let mut buf = data;
        let code = buf.get_u8();
        if code != RESPONSE_CODE {
            return Err(ErgZoneError::ParseError(format!(
                "Not a control-point response: leading byte {code:02X}"
            )));
        }

        Ok(Self {
            opcode: buf.get_u8(),
            result_code: buf.get_u8(),
        })
    }

    /// Decoded opcode, if it is one this crate sends
    #[must_use]
    pub const fn request_opcode(&self) -> Option<ControlOpcode> {
        ControlOpcode::from_u8(self.opcode)
    }

    /// Decoded result code
    #[must_use]
    pub fn result(&self) -> ResultCode {
        ResultCode::from(self.result_code)
    }

    /// Whether the trainer accepted the command
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result() == ResultCode::Success
    }

    /// Turn a rejection into an error
    ///
    /// # Errors
    ///
    /// Returns [`ErgZoneError::CommandRejected`] carrying the raw opcode and
    /// result code unless the command succeeded.
    pub fn check(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(ErgZoneError::CommandRejected {
                opcode: self.opcode,
                result_code: self.result_code,
            })
        }
    }
}

/// Decoded Indoor Bike Data notification
///
/// Fields are present only when their flag bit was set. Units are the raw wire
/// units: speed in 0.01 km/h, cadence in 0.5 rpm, distance in metres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryFrame {
    /// Instantaneous speed
    pub speed: Option<u16>,
    /// Average speed
    pub average_speed: Option<u16>,
    /// Instantaneous cadence
    pub cadence: Option<u16>,
    /// Average cadence
    pub average_cadence: Option<u16>,
    /// Total distance (24-bit)
    pub distance: Option<u32>,
    /// Resistance level
    pub resistance: Option<i16>,
    /// Instantaneous power in watts
    pub power: Option<i16>,
    /// The frame ended before every flagged field could be read
    pub truncated: bool,
}

impl TelemetryFrame {
    /// Cadence in whole rpm
    #[must_use]
    pub fn cadence_rpm(&self) -> Option<u16> {
        self.cadence.map(|raw| raw / 2)
    }
}

#[derive(Debug, Clone, Copy)]
enum TelemetryField {
    Speed,
    AverageSpeed,
    Cadence,
    AverageCadence,
    Distance,
    Resistance,
    Power,
}

/// Wire order of the fields the decoder walks: (field, flag bit, width in bytes)
///
/// Bit 0 is inverted: speed is present when it is clear ("more data").
const TELEMETRY_LAYOUT: [(TelemetryField, u16, usize); 7] = [
    (TelemetryField::Speed, 0x0001, 2),
    (TelemetryField::AverageSpeed, 0x0002, 2),
    (TelemetryField::Cadence, 0x0004, 2),
    (TelemetryField::AverageCadence, 0x0008, 2),
    (TelemetryField::Distance, 0x0010, 3),
    (TelemetryField::Resistance, 0x0020, 2),
    (TelemetryField::Power, 0x0040, 2),
];

/// Parse an Indoor Bike Data notification
///
/// Walks the flag bits in wire order, advancing past each present field and
/// bound-checking the remaining length first. A frame that runs out early
/// yields the fields read so far with `truncated` set. Returns `None` only when
/// the flag field itself is missing.
#[must_use]
pub fn parse_telemetry(data: &[u8]) -> Option<TelemetryFrame> {
    if data.len() < 2 {
        return None;
    }

    let mut buf = data;
    let flags = buf.get_u16_le();
    let mut frame = TelemetryFrame::default();

    for (field, mask, width) in TELEMETRY_LAYOUT {
        let present = match field {
            TelemetryField::Speed => flags & mask == 0,
            _ => flags & mask != 0,
        };
        if !present {
            continue;
        }
        if buf.remaining() < width {
            frame.truncated = true;
            break;
        }

        match field {
            TelemetryField::Speed => frame.speed = Some(buf.get_u16_le()),
            TelemetryField::AverageSpeed => frame.average_speed = Some(buf.get_u16_le()),
            TelemetryField::Cadence => frame.cadence = Some(buf.get_u16_le()),
            TelemetryField::AverageCadence => frame.average_cadence = Some(buf.get_u16_le()),
            #[allow(clippy::cast_possible_truncation)]
            TelemetryField::Distance => frame.distance = Some(buf.get_uint_le(3) as u32),
            TelemetryField::Resistance => frame.resistance = Some(buf.get_i16_le()),
            TelemetryField::Power => frame.power = Some(buf.get_i16_le()),
        }
    }

    Some(frame)
}
