pub mod cidr;

pub use cidr::IpNetwork;
