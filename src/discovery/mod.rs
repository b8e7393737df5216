//! mDNS `_hap._tcp` service advertisement

mod advertiser;

pub use advertiser::{AdvertiserError, MdnsAdvertiser, TxtRecords};
