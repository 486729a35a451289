use std::collections::BTreeMap;
use std::future::poll_fn;
use std::pin::Pin;
use std::task::{Context, Poll};

use actix_http::error::PayloadError;
use actix_http::{BoxedPayloadStream, Payload};
use actix_web::HttpMessage;
use actix_web::dev::ServiceRequest;
use actix_web::web::Query;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use serde_json::Value;

/// Bodies larger than this are passed through without being parsed.
pub const CAPTURE_LIMIT: usize = 256 * 1024;

/// Why a body could not be captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureIssue {
    ReadFailed(String),
    TooLarge,
}

#[derive(Debug, Default)]
pub struct Captured {
    pub value: Option<Value>,
    pub issue: Option<CaptureIssue>,
}

/// Read the request body, parse it, and put an identical stream back so the
/// handler sees exactly what the client sent.
pub async fn capture(req: &mut ServiceRequest) -> Captured {
    let content_type = req.content_type().to_ascii_lowercase();
    let mut payload = req.take_payload();

    let mut buf = BytesMut::new();
    let mut error = None;
    let mut too_large = false;

    while let Some(chunk) = poll_fn(|cx| Pin::new(&mut payload).poll_next(cx)).await {
        match chunk {
            Ok(chunk) => {
                buf.extend_from_slice(&chunk);
                if buf.len() > CAPTURE_LIMIT {
                    too_large = true;
                    break;
                }
            }
            Err(err) => {
                error = Some(err);
                break;
            }
        }
    }

    let body = buf.freeze();
    let captured = match (&error, too_large) {
        (Some(err), _) => Captured {
            value: None,
            issue: Some(CaptureIssue::ReadFailed(err.to_string())),
        },
        (None, true) => Captured {
            value: None,
            issue: Some(CaptureIssue::TooLarge),
        },
        (None, false) => Captured {
            value: parse(&content_type, &body),
            issue: None,
        },
    };

    let replay = Replay {
        buffered: (!body.is_empty()).then_some(body),
        error,
        rest: too_large.then_some(payload),
    };
    let stream: BoxedPayloadStream = Box::pin(replay);
    req.set_payload(Payload::Stream { payload: stream });

    captured
}

fn parse(content_type: &str, body: &Bytes) -> Option<Value> {
    if body.is_empty() {
        return None;
    }

    if content_type == "application/json" || content_type.ends_with("+json") {
        if let Ok(value) = serde_json::from_slice(body) {
            return Some(value);
        }
    }

    let text = std::str::from_utf8(body).ok()?;
    if content_type == "application/x-www-form-urlencoded" {
        if let Ok(form) = Query::<BTreeMap<String, String>>::from_query(text) {
            return serde_json::to_value(form.into_inner()).ok();
        }
    }

    Some(Value::String(text.to_string()))
}

/// Buffered bytes, then the read error if any, then the unread remainder.
struct Replay {
    buffered: Option<Bytes>,
    error: Option<PayloadError>,
    rest: Option<Payload>,
}

impl Stream for Replay {
    type Item = Result<Bytes, PayloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(bytes) = this.buffered.take() {
            return Poll::Ready(Some(Ok(bytes)));
        }
        if let Some(err) = this.error.take() {
            return Poll::Ready(Some(Err(err)));
        }
        match this.rest.as_mut() {
            Some(rest) => Pin::new(rest).poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use serde_json::json;

    async fn drain(req: &mut ServiceRequest) -> Vec<u8> {
        let mut payload = req.take_payload();
        let mut out = Vec::new();
        while let Some(chunk) = poll_fn(|cx| Pin::new(&mut payload).poll_next(cx)).await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[actix_web::test]
    async fn test_json_body_is_parsed_and_replayed() {
        let mut req = TestRequest::post()
            .insert_header(("content-type", "application/json; charset=utf-8"))
            .set_payload(r#"{"val1":"one"}"#)
            .to_srv_request();

        let captured = capture(&mut req).await;
        assert_eq!(captured.value, Some(json!({"val1": "one"})));
        assert_eq!(captured.issue, None);
        assert_eq!(drain(&mut req).await, br#"{"val1":"one"}"#);
    }

    #[actix_web::test]
    async fn test_form_and_text_bodies() {
        let mut req = TestRequest::post()
            .insert_header(("content-type", "application/x-www-form-urlencoded"))
            .set_payload("name=ann&age=7")
            .to_srv_request();
        let captured = capture(&mut req).await;
        assert_eq!(captured.value, Some(json!({"name": "ann", "age": "7"})));

        let mut req = TestRequest::post()
            .insert_header(("content-type", "text/plain"))
            .set_payload("hello")
            .to_srv_request();
        assert_eq!(capture(&mut req).await.value, Some(json!("hello")));
    }

    #[actix_web::test]
    async fn test_empty_and_binary_bodies_are_absent() {
        let mut req = TestRequest::get().to_srv_request();
        let captured = capture(&mut req).await;
        assert_eq!(captured.value, None);
        assert!(drain(&mut req).await.is_empty());

        let mut req = TestRequest::post()
            .set_payload(vec![0xff, 0xfe, 0x00])
            .to_srv_request();
        assert_eq!(capture(&mut req).await.value, None);
        assert_eq!(drain(&mut req).await, vec![0xff, 0xfe, 0x00]);
    }

    /// Yields one chunk, then an incomplete-payload error.
    struct Truncated {
        sent: bool,
    }

    impl Stream for Truncated {
        type Item = Result<Bytes, PayloadError>;

        fn poll_next(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let this = self.get_mut();
            if this.sent {
                return Poll::Ready(Some(Err(PayloadError::Incomplete(None))));
            }
            this.sent = true;
            Poll::Ready(Some(Ok(Bytes::from_static(b"abc"))))
        }
    }

    #[actix_web::test]
    async fn test_read_failure_is_replayed() {
        let mut req = TestRequest::post()
            .insert_header(("content-type", "text/plain"))
            .to_srv_request();
        let stream: BoxedPayloadStream = Box::pin(Truncated { sent: false });
        req.set_payload(Payload::Stream { payload: stream });

        let captured = capture(&mut req).await;
        assert_eq!(captured.value, None);
        assert!(matches!(captured.issue, Some(CaptureIssue::ReadFailed(_))));

        let mut payload = req.take_payload();
        let first = poll_fn(|cx| Pin::new(&mut payload).poll_next(cx)).await;
        assert_eq!(first.unwrap().unwrap(), Bytes::from_static(b"abc"));
        let second = poll_fn(|cx| Pin::new(&mut payload).poll_next(cx)).await;
        assert!(matches!(second, Some(Err(PayloadError::Incomplete(_)))));
        let end = poll_fn(|cx| Pin::new(&mut payload).poll_next(cx)).await;
        assert!(end.is_none());
    }

    #[actix_web::test]
    async fn test_oversized_body_passes_through() {
        let body = vec![b'a'; CAPTURE_LIMIT + 10];
        let mut req = TestRequest::post()
            .insert_header(("content-type", "text/plain"))
            .set_payload(body.clone())
            .to_srv_request();

        let captured = capture(&mut req).await;
        assert_eq!(captured.value, None);
        assert_eq!(captured.issue, Some(CaptureIssue::TooLarge));
        assert_eq!(drain(&mut req).await, body);
    }
}
