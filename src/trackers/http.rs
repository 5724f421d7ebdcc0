use crate::benc;
use crate::torrent::Torrent;
use crate::utils::ip;
use crate::utils::notify::{Notifier, SubscriptionId};
use crate::utils::peer_id::PeerId;
use reqwest::Url;
use std::fmt::{self, Write as _};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use std::{io, str};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("announce request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("announce URL is invalid: {0}")]
    Url(#[from] url::ParseError),
    #[error("cannot decode tracker response: {0}")]
    Benc(#[from] benc::ParseError),
    #[error("tracker rejected the request: {0}")]
    Response(String),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Network(_) => io::ErrorKind::UnexpectedEof,
            Error::Url(_) => io::ErrorKind::InvalidInput,
            Error::Benc(_) => io::ErrorKind::InvalidData,
            Error::Response(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Paused,
    Stopped,
}

impl AnnounceEvent {
    pub fn name(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Paused => "paused",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

/// Transfer state reported to the tracker in one announce.
pub struct AnnounceRequest<'a> {
    pub info_hash: &'a [u8; 20],
    pub peer_id: &'a [u8; 20],
    pub port: u16,
    pub uploaded: usize,
    pub downloaded: usize,
    pub left: usize,
    pub event: AnnounceEvent,
    pub num_want: Option<usize>,
}

impl AnnounceRequest<'_> {
    /// Serialize all fields into the query string of the announce URL.
    /// Compact peer lists are always requested.
    fn build_url(&self, announce_url: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(announce_url)?;
        let mut query = String::with_capacity(160);
        push_raw_param(&mut query, "info_hash", self.info_hash);
        push_raw_param(&mut query, "peer_id", self.peer_id);
        push_param(&mut query, "port", self.port);
        push_param(&mut query, "uploaded", self.uploaded);
        push_param(&mut query, "downloaded", self.downloaded);
        push_param(&mut query, "left", self.left);
        push_param(&mut query, "event", self.event.name());
        if let Some(num_want) = self.num_want {
            push_param(&mut query, "numwant", num_want);
        }
        push_param(&mut query, "compact", 1);
        url.set_query(Some(&query));
        Ok(url)
    }
}

// values here are digits or fixed words, only byte parameters need escaping
fn push_param(query: &mut String, name: &str, value: impl fmt::Display) {
    if !query.is_empty() {
        query.push('&');
    }
    let _ = write!(query, "{name}={value}");
}

fn push_raw_param(query: &mut String, name: &str, value: &[u8]) {
    if !query.is_empty() {
        query.push('&');
    }
    query.push_str(name);
    query.push('=');
    query.extend(form_urlencoded::byte_serialize(value));
}

/// Blocking HTTP client for announce requests, shared between trackers.
#[derive(Clone)]
pub struct TrackerClient {
    http: reqwest::blocking::Client,
}

impl TrackerClient {
    /// `timeout_sec` bounds every individual announce request.
    pub fn new(timeout_sec: u64) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .timeout(Duration::from_secs(timeout_sec))
            .build()?;
        Ok(TrackerClient { http })
    }

    pub fn announce(
        &self,
        announce_url: &str,
        request: &AnnounceRequest<'_>,
    ) -> Result<AnnounceResponse, Error> {
        let url = request.build_url(announce_url)?;
        log::debug!("Announcing to {url}");

        let payload = self.http.get(url).send()?.error_for_status()?.bytes()?;
        let response = AnnounceResponse::parse(&payload)?;
        log::debug!("Announce response from {announce_url}: {response}");
        Ok(response)
    }
}

/// Decoded announce response. A reported failure surfaces as
/// [`Error::Response`] instead.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Minimum delay in seconds before the next periodic announce.
    pub interval: Option<u64>,
    pub seeders: Option<usize>,
    pub leechers: Option<usize>,
    pub warning: Option<String>,
    /// Peer endpoints, from the compact byte-string form, the dictionary
    /// form, and compact `peers6` records.
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let root = match benc::Element::from_bytes(payload)? {
            benc::Element::Dictionary(dict) => benc::convert_dictionary(dict),
            _ => return Err(Error::Response("response is not a dictionary".to_string())),
        };

        if let Some(benc::Element::ByteString(reason)) = root.get("failure reason") {
            return Err(Error::Response(String::from_utf8_lossy(reason).into_owned()));
        }

        let count_of = |key: &str| match root.get(key) {
            Some(benc::Element::Integer(value)) => usize::try_from(*value).ok(),
            _ => None,
        };

        let mut peers = Vec::new();
        match root.get("peers") {
            Some(benc::Element::ByteString(data)) => {
                peers.extend(ip::compact_v4_peers(data).map(SocketAddr::V4));
            }
            Some(benc::Element::List(entries)) => {
                peers.extend(entries.iter().filter_map(peer_from_dictionary));
            }
            _ => (),
        }
        if let Some(benc::Element::ByteString(data)) = root.get("peers6") {
            peers.extend(ip::compact_v6_peers(data).map(SocketAddr::V6));
        }

        Ok(AnnounceResponse {
            interval: count_of("interval").map(|seconds| seconds as u64),
            seeders: count_of("complete"),
            leechers: count_of("incomplete"),
            warning: match root.get("warning message") {
                Some(benc::Element::ByteString(text)) => {
                    Some(String::from_utf8_lossy(text).into_owned())
                }
                _ => None,
            },
            peers,
        })
    }
}

impl fmt::Display for AnnounceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interval={:?} seeders={:?} leechers={:?} peers={}",
            self.interval,
            self.seeders,
            self.leechers,
            self.peers.len()
        )?;
        if let Some(warning) = &self.warning {
            write!(f, " warning=\"{warning}\"")?;
        }
        Ok(())
    }
}

fn peer_from_dictionary(entry: &benc::Element) -> Option<SocketAddr> {
    let benc::Element::Dictionary(dict) = entry else {
        return None;
    };
    let benc::Element::ByteString(address) = dict.get(&benc::Element::from("ip"))? else {
        return None;
    };
    let benc::Element::Integer(port) = dict.get(&benc::Element::from("port"))? else {
        return None;
    };
    let address: IpAddr = str::from_utf8(address).ok()?.parse().ok()?;
    Some(SocketAddr::new(address, u16::try_from(*port).ok()?))
}

// -------------------------------------------------------------------------------------------------

/// One tracker of a torrent. Keeps the interval requested by the tracker and
/// publishes received peer lists to its subscribers.
pub struct Tracker {
    address: String,
    min_interval: Mutex<Duration>,
    last_started: Mutex<Option<Instant>>,
    peer_events: Notifier<Vec<SocketAddr>>,
}

impl Tracker {
    pub fn new(address: impl Into<String>) -> Self {
        Tracker {
            address: address.into(),
            min_interval: Mutex::new(Duration::ZERO),
            last_started: Mutex::new(None),
            peer_events: Notifier::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Subscribe to peer lists received in announce responses.
    pub fn subscribe_peer_lists(
        &self,
        callback: impl Fn(&Vec<SocketAddr>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.peer_events.subscribe(callback)
    }

    pub fn unsubscribe_peer_lists(&self, id: SubscriptionId) -> bool {
        self.peer_events.unsubscribe(id)
    }

    /// Announce the torrent's state to this tracker. A `started` announce
    /// issued before the interval requested by the tracker has elapsed is
    /// skipped and returns `Ok(false)`. Subscribers are notified of the
    /// received peer list before this returns.
    pub fn announce(
        &self,
        client: &TrackerClient,
        torrent: &Torrent,
        peer_id: &PeerId,
        port: u16,
        event: AnnounceEvent,
    ) -> Result<bool, Error> {
        if event == AnnounceEvent::Started && !self.interval_elapsed() {
            log::debug!("Skipping announce to {}, interval not elapsed", self.address);
            return Ok(false);
        }

        let request = AnnounceRequest {
            info_hash: torrent.info_hash(),
            peer_id: peer_id.as_bytes(),
            port,
            uploaded: torrent.uploaded_bytes(),
            downloaded: torrent.downloaded_bytes(),
            left: torrent.left_bytes(),
            event,
            num_want: None,
        };
        let response = client.announce(&self.address, &request)?;

        if event == AnnounceEvent::Started {
            *self.last_started.lock().unwrap() = Some(Instant::now());
        }
        if let Some(seconds) = response.interval {
            *self.min_interval.lock().unwrap() = Duration::from_secs(seconds);
        }
        if !response.peers.is_empty() {
            self.peer_events.notify(&response.peers);
        }
        Ok(true)
    }

    fn interval_elapsed(&self) -> bool {
        match *self.last_started.lock().unwrap() {
            Some(instant) => instant.elapsed() >= *self.min_interval.lock().unwrap(),
            None => true,
        }
    }
}
