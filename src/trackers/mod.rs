mod http;

pub use http::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, Error, Tracker, TrackerClient,
};
