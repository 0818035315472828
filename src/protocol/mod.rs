//! Remote fit-control wire protocol.
//!
//! A connection carries two phases on one ordered byte stream:
//!
//! ```text
//! Client                                  Server
//!    |                                      |
//!    |------ challenge token (hex) -------->|  handshake (unframed)
//!    |<----- response token (hex) ----------|
//!    |                                      |
//!    |------ MODEL_TRANSFER --------------->|  framed messages
//!    |------ ACTION(START_FIT) ------------>|
//!    |<----- OPTIMIZER_UPDATE(PARAMETER) ---|
//!    |<----- OPTIMIZER_UPDATE(PROGRESS) ----|  (repeated)
//!    |------ ECHO("ping") ----------------->|
//!    |<----- TEXT("ping") ------------------|
//!    |<----- OPTIMIZER_UPDATE(RESULT) ------|
//!    |------ ACTION(STOP_FIT) ------------->|
//!    |<===== connection closed =============|
//! ```
//!
//! ## Message Types
//!
//! | Type               | Direction      | Purpose                              |
//! |--------------------|----------------|--------------------------------------|
//! | `TEXT`             | Bidirectional  | Log/status line, error reports       |
//! | `ECHO`             | Client→Server  | Liveness probe                       |
//! | `ACTION`           | Client→Server  | `START_FIT` / `STOP_FIT`             |
//! | `MODEL_TRANSFER`   | Client→Server  | Replace model and fit parameters     |
//! | `OPTIMIZER_UPDATE` | Server→Client  | Parameter info, progress, result     |
//!
//! ## Session States
//!
//! | State            | Description                          | Valid Transitions        |
//! |------------------|--------------------------------------|--------------------------|
//! | `Connecting`     | Accepted, waiting for the lock       | → Authenticating, Closed |
//! | `Authenticating` | Handshake in progress                | → Active, Closed         |
//! | `Active`         | Message loop                         | → Closing                |
//! | `Closing`        | Stop requested, draining optimizer   | → Closed                 |
//! | `Closed`         | Connection torn down                 | (terminal)               |

mod frame;
mod handshake;
mod message;
mod session;

pub use frame::{read_message, write_message, MessageTag, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use handshake::{
    accept, initiate, Authenticator, SharedKey, AUTH_SIZE, DEFAULT_AUTH_KEY, HANDSHAKE1,
    HANDSHAKE2, MAX_KEY_SIZE,
};
pub use message::{
    ActionKind, Message, OptimizerUpdate, ParameterInfo, ProgressUpdate, ResultInfo,
    TerminationReason,
};
pub use session::{Session, SessionState, SessionStats};
