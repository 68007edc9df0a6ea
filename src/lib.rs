pub mod membership;
pub mod messaging;
pub mod multicast;
pub mod util;
pub mod test_util;
