pub mod connectivity;
pub mod profiles;
pub mod stats;

pub use connectivity::{ConnectivityProbe, TcpProbe};
pub use profiles::{NetworkProfiles, Nmcli, ProfileSpec};
pub use stats::{ConnectionSnapshot, NetStatus, SysfsNetStatus};
