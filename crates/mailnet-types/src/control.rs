//! [`Control`] – router-level commands.
//!
//! A frame whose destination is [`MailboxAddr::ROUTER`] is not delivered to
//! any mailbox; it is decoded once into a `Control` value and handled by the
//! router or client that received it.

use crate::address::MailboxAddr;
use crate::envelope::{Envelope, HEADER_LEN};
use crate::error::MailError;
use crate::msg;

/// Message type numbers of router control frames.
pub mod code {
    use crate::msg;

    pub const LOGIN: i8 = 1;
    pub const MBX_INIT: i8 = 2;
    pub const MBX_DELETE: i8 = 3;
    pub const MBX_INIT_WITH_REPLY: i8 = 4;
    pub const MBX_DELETE_WITH_REPLY: i8 = 5;
    pub const MBX_PURGE: i8 = 6;
    pub const GET_STATUS: i8 = msg::GET_STATUS;
    pub const OK: i8 = msg::OK;
    pub const ERROR: i8 = msg::ERROR;
}

/// A decoded router control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// First frame of every session.
    Login,
    /// Route `mbx` to the sending connection.  `reply` asks for `Ok`/`Error`.
    MbxInit { mbx: MailboxAddr, reply: bool },
    /// Drop the route for `mbx`.
    MbxDelete { mbx: MailboxAddr, reply: bool },
    /// Drop every route owned by the sending connection.
    MbxPurge,
    /// Liveness ping; answered with [`Control::Ok`].
    GetStatus,
    Ok,
    Error,
}

impl Control {
    /// Decode a control frame.
    ///
    /// # Errors
    ///
    /// [`MailError::Protocol`] for an unknown command number or a mailbox
    /// command whose payload is not exactly one `u32`.
    pub fn decode(env: &Envelope, payload: &[u8]) -> Result<Self, MailError> {
        let mbx = || -> Result<MailboxAddr, MailError> {
            let bytes: [u8; 4] = payload.try_into().map_err(|_| {
                MailError::Protocol(format!(
                    "control type {} needs a 4 byte mailbox payload, got {} bytes",
                    env.msg_type,
                    payload.len()
                ))
            })?;
            Ok(MailboxAddr(env.byte_order().read_u32(bytes)))
        };

        match env.msg_type {
            code::LOGIN => Ok(Control::Login),
            code::MBX_INIT => Ok(Control::MbxInit { mbx: mbx()?, reply: false }),
            code::MBX_INIT_WITH_REPLY => Ok(Control::MbxInit { mbx: mbx()?, reply: true }),
            code::MBX_DELETE => Ok(Control::MbxDelete { mbx: mbx()?, reply: false }),
            code::MBX_DELETE_WITH_REPLY => Ok(Control::MbxDelete { mbx: mbx()?, reply: true }),
            code::MBX_PURGE => Ok(Control::MbxPurge),
            code::GET_STATUS => Ok(Control::GetStatus),
            code::OK => Ok(Control::Ok),
            code::ERROR => Ok(Control::Error),
            other => Err(MailError::Protocol(format!("unknown control type {other}"))),
        }
    }

    /// Message type number carried in the envelope.
    pub fn msg_type(&self) -> i8 {
        match self {
            Control::Login => code::LOGIN,
            Control::MbxInit { reply: false, .. } => code::MBX_INIT,
            Control::MbxInit { reply: true, .. } => code::MBX_INIT_WITH_REPLY,
            Control::MbxDelete { reply: false, .. } => code::MBX_DELETE,
            Control::MbxDelete { reply: true, .. } => code::MBX_DELETE_WITH_REPLY,
            Control::MbxPurge => code::MBX_PURGE,
            Control::GetStatus => code::GET_STATUS,
            Control::Ok => msg::OK,
            Control::Error => msg::ERROR,
        }
    }

    /// Encode as a complete frame from and to the router address.
    pub fn to_frame(&self, seq_nr: u8) -> Vec<u8> {
        let payload = match self {
            Control::MbxInit { mbx, .. } | Control::MbxDelete { mbx, .. } => {
                Some(mbx.raw().to_ne_bytes())
            }
            _ => None,
        };
        let payload_len = payload.map_or(0, |p| p.len());
        let mut env = Envelope::new(self.msg_type(), MailboxAddr::ROUTER, MailboxAddr::ROUTER, seq_nr);
        env.total_len = (HEADER_LEN + payload_len) as u32;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload_len);
        env.encode(&mut frame);
        if let Some(p) = payload {
            frame.extend_from_slice(&p);
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_frame(frame: &[u8]) -> Result<Control, MailError> {
        let env = Envelope::decode(frame)?;
        Control::decode(&env, &frame[HEADER_LEN..env.total_len as usize])
    }

    #[test]
    fn mailbox_commands_carry_their_address() {
        let mbx = MailboxAddr::compose(2, 1, 0, 3);
        for ctl in [
            Control::MbxInit { mbx, reply: false },
            Control::MbxInit { mbx, reply: true },
            Control::MbxDelete { mbx, reply: false },
            Control::MbxDelete { mbx, reply: true },
        ] {
            let frame = ctl.to_frame(9);
            assert_eq!(frame.len(), HEADER_LEN + 4);
            assert_eq!(decode_frame(&frame).unwrap(), ctl);
        }
    }

    #[test]
    fn control_frames_are_router_to_router() {
        let frame = Control::GetStatus.to_frame(1);
        let env = Envelope::decode(&frame).unwrap();
        assert!(env.src.is_router());
        assert!(env.dest.is_router());
        assert_eq!(env.seq_nr, 1);
    }

    #[test]
    fn wrong_payload_length_is_a_protocol_error() {
        let mut env = Envelope::new(code::MBX_INIT, MailboxAddr::ROUTER, MailboxAddr::ROUTER, 0);
        env.total_len = (HEADER_LEN + 2) as u32;
        let err = Control::decode(&env, &[1, 2]).unwrap_err();
        assert!(matches!(err, MailError::Protocol(_)));
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let env = Envelope::new(99, MailboxAddr::ROUTER, MailboxAddr::ROUTER, 0);
        assert!(matches!(Control::decode(&env, &[]), Err(MailError::Protocol(_))));
    }

    #[test]
    fn big_endian_payload_is_normalised() {
        let mut env = Envelope::new(code::MBX_DELETE, MailboxAddr::ROUTER, MailboxAddr::ROUTER, 0);
        env.flags &= !crate::flags::LITTLE_ENDIAN;
        let ctl = Control::decode(&env, &[0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(
            ctl,
            Control::MbxDelete { mbx: MailboxAddr(0x0102_0304), reply: false }
        );
    }
}
