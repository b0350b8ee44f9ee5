//! The pvdd text protocol.
//!
//! pvdd speaks newline-terminated UTF-8 over a local TCP socket:
//!
//! ```text
//! ┌─────────────┐   PVD_GET_LIST\n                 ┌──────────┐
//! │ PvddClient  │ ───────────────────────────────► │   pvdd   │
//! │             │ ◄─────────────────────────────── │ (daemon) │
//! └─────────────┘   PVD_LIST foo.example.com\n     └──────────┘
//! ```
//!
//! Inbound bytes go through three stages:
//!
//! 1. [`LineBuffer`] splits chunks into complete lines
//! 2. [`FrameDecoder`] reassembles `PVD_BEGIN_MULTILINE` blocks into frames
//! 3. [`interpret`] turns a frame into a [`PvdEvent`]
//!
//! Outbound traffic is a [`Command`] rendered with [`Command::to_wire`].

mod command;
mod framing;
mod message;

pub use command::Command;
pub use framing::{
    Frame, FrameDecoder, FrameError, LineBuffer, BEGIN_MULTILINE, END_MULTILINE, MAX_FRAME_SIZE,
};
pub use message::{interpret, PvdEvent};
