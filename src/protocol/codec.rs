//! Cell codec: byte-exact framing of fixed- and variable-length Tor cells
//! (§4.1) and the relay-cell payload nested inside RELAY/RELAY_EARLY cells.

use crate::convert::len_to_u16;
use crate::error::{Result, TorError};
use std::io::Write;

/// Hard cap on any single cell's payload, matching the spec's stated policy
/// limit independent of what the wire `u16` length field could encode.
pub const MAX_CELL_PAYLOAD: usize = 16 * 1024;

/// Commands carried by a fixed-length (514-byte) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            _ => None,
        }
    }

    pub fn is_relay(self) -> bool {
        matches!(self, CellCommand::Relay | CellCommand::RelayEarly)
    }
}

/// Commands carried by a variable-length cell (3-byte length-prefixed body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VarCellCommand {
    Versions = 7,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl VarCellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            7 => Some(VarCellCommand::Versions),
            128 => Some(VarCellCommand::Vpadding),
            129 => Some(VarCellCommand::Certs),
            130 => Some(VarCellCommand::AuthChallenge),
            131 => Some(VarCellCommand::Authenticate),
            132 => Some(VarCellCommand::Authorize),
            _ => None,
        }
    }
}

/// A Tor link-layer cell, tagged by shape rather than a shared superclass:
/// fixed cells are always exactly 514 bytes on the wire, variable cells carry
/// their own length prefix.
#[derive(Debug, Clone)]
pub enum Cell {
    Fixed {
        circuit_id: u32,
        command: CellCommand,
        payload: Vec<u8>,
    },
    Variable {
        circuit_id: u32,
        command: VarCellCommand,
        payload: Vec<u8>,
    },
}

impl Cell {
    pub const FIXED_SIZE: usize = 514;
    pub const FIXED_PAYLOAD_SIZE: usize = 509;
    /// Circuit-id width before VERSIONS negotiation completes.
    pub const LEGACY_CIRCID_SIZE: usize = 2;
    pub const CIRCID_SIZE: usize = 4;

    pub fn circuit_id(&self) -> u32 {
        match self {
            Cell::Fixed { circuit_id, .. } | Cell::Variable { circuit_id, .. } => *circuit_id,
        }
    }

    pub fn fixed(circuit_id: u32, command: CellCommand, mut payload: Vec<u8>) -> Result<Self> {
        if payload.len() > Self::FIXED_PAYLOAD_SIZE {
            return Err(TorError::PayloadTooLarge(payload.len()));
        }
        payload.resize(Self::FIXED_PAYLOAD_SIZE, 0);
        Ok(Cell::Fixed {
            circuit_id,
            command,
            payload,
        })
    }

    pub fn variable(circuit_id: u32, command: VarCellCommand, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_CELL_PAYLOAD {
            return Err(TorError::PayloadTooLarge(payload.len()));
        }
        len_to_u16(payload.len())?;
        Ok(Cell::Variable {
            circuit_id,
            command,
            payload,
        })
    }

    /// Serialize using 4-byte circuit IDs (post-VERSIONS link state).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_bytes_with_circid_width(Self::CIRCID_SIZE)
    }

    pub fn to_bytes_with_circid_width(&self, circid_width: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Cell::Fixed {
                circuit_id,
                command,
                payload,
            } => {
                write_circid(&mut buf, *circuit_id, circid_width)?;
                buf.push(*command as u8);
                buf.write_all(payload)
                    .map_err(|e| TorError::Internal(e.to_string()))?;
                debug_assert_eq!(buf.len(), circid_width + 1 + Self::FIXED_PAYLOAD_SIZE);
            }
            Cell::Variable {
                circuit_id,
                command,
                payload,
            } => {
                write_circid(&mut buf, *circuit_id, circid_width)?;
                buf.push(*command as u8);
                let len = len_to_u16(payload.len())?;
                buf.write_all(&len.to_be_bytes())
                    .map_err(|e| TorError::Internal(e.to_string()))?;
                buf.write_all(payload)
                    .map_err(|e| TorError::Internal(e.to_string()))?;
            }
        }
        Ok(buf)
    }

    /// Decode one cell from a byte buffer that already contains a full cell
    /// (link-reading code is responsible for buffering up to a full frame;
    /// see `crate::link`). `circid_width` is 2 before VERSIONS, 4 after.
    pub fn decode(data: &[u8], circid_width: usize) -> Result<(Self, usize)> {
        if data.len() < circid_width + 1 {
            return Err(TorError::MalformedCell("truncated cell header".into()));
        }
        let circuit_id = read_circid(data, circid_width);
        let command_byte = data[circid_width];

        if let Some(command) = CellCommand::from_u8(command_byte) {
            let end = circid_width + 1 + Self::FIXED_PAYLOAD_SIZE;
            if data.len() < end {
                return Err(TorError::MalformedCell("truncated fixed cell".into()));
            }
            let payload = data[circid_width + 1..end].to_vec();
            return Ok((
                Cell::Fixed {
                    circuit_id,
                    command,
                    payload,
                },
                end,
            ));
        }

        if let Some(command) = VarCellCommand::from_u8(command_byte) {
            let len_off = circid_width + 1;
            if data.len() < len_off + 2 {
                return Err(TorError::MalformedCell("truncated variable cell length".into()));
            }
            let length = u16::from_be_bytes([data[len_off], data[len_off + 1]]) as usize;
            if length > MAX_CELL_PAYLOAD {
                return Err(TorError::MalformedCell(format!(
                    "variable cell length {length} exceeds policy cap"
                )));
            }
            let body_off = len_off + 2;
            let end = body_off + length;
            if data.len() < end {
                return Err(TorError::MalformedCell("truncated variable cell body".into()));
            }
            let payload = data[body_off..end].to_vec();
            return Ok((
                Cell::Variable {
                    circuit_id,
                    command,
                    payload,
                },
                end,
            ));
        }

        Err(TorError::MalformedCell(format!(
            "unknown cell command {command_byte}"
        )))
    }
}

fn write_circid(buf: &mut Vec<u8>, circuit_id: u32, width: usize) -> Result<()> {
    match width {
        2 => {
            let v = u16::try_from(circuit_id)
                .map_err(|_| TorError::ProtocolError("circuit id exceeds legacy width".into()))?;
            buf.extend_from_slice(&v.to_be_bytes());
        }
        4 => buf.extend_from_slice(&circuit_id.to_be_bytes()),
        _ => return Err(TorError::Internal("unsupported circid width".into())),
    }
    Ok(())
}

fn read_circid(data: &[u8], width: usize) -> u32 {
    match width {
        2 => u16::from_be_bytes([data[0], data[1]]) as u32,
        _ => u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
    }
}

/// Relay command carried inside a RELAY/RELAY_EARLY cell's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
    EstablishRendezvous = 33,
    RendezvousEstablished = 39,
    Introduce1 = 34,
    Introduce2 = 35,
    Rendezvous1 = 36,
    Rendezvous2 = 37,
    IntroEstablished = 38,
    IntroduceAck = 40,
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// The decoded relay-cell payload: `{command, recognized, stream-id, digest,
/// length, data}` per §4.1. `recognized`/`digest` are meaningful only after
/// a hop's onion layer has been peeled; see `crate::protocol::circuit`.
#[derive(Debug, Clone)]
pub struct RelayCell {
    pub command: RelayCommand,
    pub recognized: u16,
    pub stream_id: u16,
    pub digest: [u8; 4],
    pub data: Vec<u8>,
}

impl RelayCell {
    pub const MAX_DATA_SIZE: usize = 498;
    const HEADER_SIZE: usize = 11;

    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::PayloadTooLarge(data.len()));
        }
        Ok(Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        })
    }

    /// Serialize into the fixed 509-byte cell payload, zero-padded. The
    /// digest field must already have been filled by the caller (running
    /// digest state lives in the circuit, not here).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let len = len_to_u16(self.data.len())?;
        let mut buf = Vec::with_capacity(Cell::FIXED_PAYLOAD_SIZE);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(Cell::FIXED_PAYLOAD_SIZE, 0);
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(TorError::MalformedCell("relay cell too short".into()));
        }
        let command = RelayCommand::from_u8(data[0])
            .ok_or_else(|| TorError::MalformedCell(format!("unknown relay command {}", data[0])))?;
        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]) as usize;
        let data_end = Self::HEADER_SIZE + length;
        if data_end > data.len() {
            return Err(TorError::MalformedCell("relay cell data truncated".into()));
        }
        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: data[Self::HEADER_SIZE..data_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_cell_round_trip() {
        let cell = Cell::fixed(12345, CellCommand::Create2, vec![1, 2, 3, 4]).unwrap();
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::FIXED_SIZE);

        let (parsed, consumed) = Cell::decode(&bytes, Cell::CIRCID_SIZE).unwrap();
        assert_eq!(consumed, bytes.len());
        match parsed {
            Cell::Fixed {
                circuit_id,
                command,
                ..
            } => {
                assert_eq!(circuit_id, 12345);
                assert_eq!(command as u8, CellCommand::Create2 as u8);
            }
            _ => panic!("expected fixed cell"),
        }
    }

    #[test]
    fn variable_cell_round_trip() {
        let payload = vec![9u8; 300];
        let cell = Cell::variable(1, VarCellCommand::Versions, payload.clone()).unwrap();
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::CIRCID_SIZE + 1 + 2 + payload.len());

        let (parsed, consumed) = Cell::decode(&bytes, Cell::CIRCID_SIZE).unwrap();
        assert_eq!(consumed, bytes.len());
        match parsed {
            Cell::Variable {
                command, payload: p, ..
            } => {
                assert_eq!(command as u8, VarCellCommand::Versions as u8);
                assert_eq!(p, payload);
            }
            _ => panic!("expected variable cell"),
        }
    }

    #[test]
    fn rejects_oversized_relay_payload() {
        assert!(RelayCell::new(RelayCommand::Data, 1, vec![0u8; 499]).is_err());
    }

    #[test]
    fn rejects_variable_cell_over_policy_cap() {
        let huge = vec![0u8; MAX_CELL_PAYLOAD + 1];
        assert!(Cell::variable(1, VarCellCommand::Vpadding, huge).is_err());
    }

    #[test]
    fn relay_cell_serialization_round_trip() {
        let relay = RelayCell::new(RelayCommand::Begin, 100, vec![5, 6, 7]).unwrap();
        let bytes = relay.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::FIXED_PAYLOAD_SIZE);

        let parsed = RelayCell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.command as u8, RelayCommand::Begin as u8);
        assert_eq!(parsed.stream_id, 100);
        assert_eq!(parsed.data, vec![5, 6, 7]);
    }

    #[test]
    fn legacy_circid_width_round_trip() {
        let cell = Cell::fixed(42, CellCommand::Destroy, vec![1]).unwrap();
        let bytes = cell
            .to_bytes_with_circid_width(Cell::LEGACY_CIRCID_SIZE)
            .unwrap();
        assert_eq!(bytes.len(), Cell::LEGACY_CIRCID_SIZE + 1 + Cell::FIXED_PAYLOAD_SIZE);

        let (parsed, _) = Cell::decode(&bytes, Cell::LEGACY_CIRCID_SIZE).unwrap();
        assert_eq!(parsed.circuit_id(), 42);
    }
}
