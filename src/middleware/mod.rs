mod marketplace_access;

pub use marketplace_access::{MARKETPLACE_ID_PARAM, marketplace_access_middleware};
