//! Relay engine
//!
//! Frames from a paired peer are forwarded verbatim to its partner. The
//! frame is parsed as a JSON envelope only to produce diagnostics; what
//! happens when it is not JSON is decided by [`PayloadPolicy`].

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use signal_core::PayloadPolicy;

use crate::error::ConnectionError;
use crate::registry::PeerHandle;

/// Session description carried in an `{"sdp": {...}}` envelope
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub sdp: String,
}

/// What a relayed frame turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A negotiation description
    Description(SessionDescription),
    /// Any other JSON value
    Other,
}

impl Envelope {
    /// Parse a frame for logging. Fails only if the frame is not JSON.
    pub fn inspect(frame: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(frame)?;
        let description = value
            .get("sdp")
            .filter(|sdp| sdp.is_object())
            .and_then(|sdp| SessionDescription::deserialize(sdp).ok());

        Ok(match description {
            Some(desc) => Envelope::Description(desc),
            None => Envelope::Other,
        })
    }
}

/// Forward `frame` from `from` to `partner`.
///
/// Under [`PayloadPolicy::Disconnect`] a non-JSON frame is not forwarded and
/// the error is returned so the sender's handler ends.
pub async fn relay_frame(
    from: &str,
    partner: &str,
    handle: &PeerHandle,
    frame: String,
    policy: PayloadPolicy,
) -> Result<(), ConnectionError> {
    match Envelope::inspect(&frame) {
        Ok(Envelope::Description(desc)) => {
            debug!("{} -> {}: SDP message: {}", from, partner, desc.kind);
            for line in desc.sdp.lines() {
                debug!("  {}", line);
            }
        }
        Ok(Envelope::Other) => debug!("{} -> {}: {}", from, partner, frame),
        Err(e) => match policy {
            PayloadPolicy::Disconnect => {
                warn!("{} -> {}: unparseable frame, dropping sender: {}", from, partner, frame);
                return Err(ConnectionError::MalformedPayload(e));
            }
            PayloadPolicy::Forward => {
                debug!("{} -> {}: {}", from, partner, frame);
            }
        },
    }

    // A closed partner means teardown is already under way
    if handle.is_closed() {
        debug!("Partner {} closing, dropping frame from {}", partner, from);
        return Ok(());
    }
    if handle.send_text(frame).await.is_err() {
        debug!("Partner {} gone, dropping frame from {}", partner, from);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;

    #[test]
    fn test_inspect_description() {
        let frame = r#"{"sdp":{"type":"offer","sdp":"v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n"}}"#;
        match Envelope::inspect(frame).unwrap() {
            Envelope::Description(desc) => {
                assert_eq!(desc.kind, "offer");
                assert_eq!(desc.sdp.lines().count(), 2);
            }
            Envelope::Other => panic!("expected description"),
        }
    }

    #[test]
    fn test_inspect_other_json() {
        let ice = r#"{"ice":{"candidate":"candidate:1 1 UDP 2122252543 10.0.0.2 40000 typ host","sdpMLineIndex":0}}"#;
        assert_eq!(Envelope::inspect(ice).unwrap(), Envelope::Other);
        assert_eq!(Envelope::inspect("42").unwrap(), Envelope::Other);
        assert_eq!(Envelope::inspect(r#"{"sdp":"raw"}"#).unwrap(), Envelope::Other);
    }

    #[test]
    fn test_inspect_not_json() {
        assert!(Envelope::inspect("hello-payload").is_err());
    }

    #[tokio::test]
    async fn test_relay_forwards_verbatim() {
        let (handle, mut channels) = PeerHandle::channel(4);
        let frame = r#"{"sdp":{"type":"answer","sdp":"v=0"}}"#.to_string();

        relay_frame("x1", "y1", &handle, frame.clone(), PayloadPolicy::Disconnect)
            .await
            .unwrap();

        assert_eq!(channels.outbound.recv().await, Some(Outbound::Text(frame)));
    }

    #[tokio::test]
    async fn test_relay_malformed_disconnects_sender() {
        let (handle, mut channels) = PeerHandle::channel(4);

        let result = relay_frame(
            "x1",
            "y1",
            &handle,
            "hello-payload".into(),
            PayloadPolicy::Disconnect,
        )
        .await;

        assert!(matches!(result, Err(ConnectionError::MalformedPayload(_))));
        assert!(channels.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_malformed_forwarded_when_allowed() {
        let (handle, mut channels) = PeerHandle::channel(4);

        relay_frame("x1", "y1", &handle, "hello-payload".into(), PayloadPolicy::Forward)
            .await
            .unwrap();

        assert_eq!(
            channels.outbound.recv().await,
            Some(Outbound::Text("hello-payload".into()))
        );
    }

    #[tokio::test]
    async fn test_relay_to_gone_partner_is_not_an_error() {
        let (handle, channels) = PeerHandle::channel(4);
        drop(channels);

        relay_frame("x1", "y1", &handle, "{}".into(), PayloadPolicy::Disconnect)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_to_closing_partner_drops_frame() {
        let (handle, mut channels) = PeerHandle::channel(4);
        handle.close();

        relay_frame("x1", "y1", &handle, "{}".into(), PayloadPolicy::Disconnect)
            .await
            .unwrap();
        assert!(channels.outbound.try_recv().is_err());
    }
}
