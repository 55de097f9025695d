pub mod mode;
pub mod scanner;
pub mod signal;
pub mod transport;

pub use mode::{ModeController, ModemMode};
pub use signal::SignalSnapshot;
pub use transport::{
    AtChannel, AtTransport, CommandOutcome, Completion, PortOpener, SerialLink,
    SerialSettings, SerialportOpener,
};
