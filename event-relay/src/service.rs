use crate::errors::{EnvelopeError, RelayError};
use crate::relay::{EventRelay, Outcome};
use http::header::{ALLOW, HeaderValue};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{make_boxed_error_response, make_boxed_response, make_empty_response};
use std::pin::Pin;
use std::sync::Arc;

const TRACEPARENT_HEADER: &str = "traceparent";

/// Push endpoint. `GET /` answers liveness checks, the stream path feeds
/// the relay.
#[derive(Clone)]
pub struct RelayService {
    inner: Arc<Inner>,
}

struct Inner {
    relay: EventRelay,
    stream_path: String,
    max_body_bytes: usize,
}

impl RelayService {
    pub fn new(relay: EventRelay, stream_path: &str, max_body_bytes: usize) -> Self {
        RelayService {
            inner: Arc::new(Inner {
                relay,
                stream_path: stream_path.to_owned(),
                max_body_bytes,
            }),
        }
    }
}

impl Inner {
    async fn route<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, RelayError>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path();
        if path == "/" {
            return match *req.method() {
                Method::GET | Method::HEAD => make_empty_response(StatusCode::OK),
                _ => method_not_allowed("GET, HEAD"),
            };
        }
        if path != self.stream_path {
            return make_boxed_error_response(StatusCode::NOT_FOUND);
        }
        if req.method() != Method::POST {
            return method_not_allowed("POST");
        }

        let outcome = match self.read_body(req.into_body()).await {
            Ok(body) => self.relay.process(&body).await,
            Err((error, body_size)) => self.relay.reject(error, body_size),
        };
        self.respond(outcome)
    }

    /// Collects the request body, refusing anything over `max_body_bytes`.
    ///
    /// On failure also returns how many body bytes were seen: the declared
    /// length when the client sent one, otherwise what arrived before the
    /// read stopped.
    async fn read_body<B>(&self, body: B) -> Result<Bytes, (EnvelopeError, usize)>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let too_large = EnvelopeError::BodyTooLarge {
            limit: self.max_body_bytes,
        };
        let declared = body.size_hint().lower() as usize;
        if declared > self.max_body_bytes {
            return Err((too_large, declared));
        }

        let mut body = std::pin::pin!(body);
        let mut collected = Vec::with_capacity(declared);
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| {
                let e: Box<dyn std::error::Error + Send + Sync> = e.into();
                (EnvelopeError::BodyRead(e.to_string()), collected.len())
            })?;
            if let Ok(data) = frame.into_data() {
                let received = collected.len() + data.len();
                if received > self.max_body_bytes {
                    return Err((too_large, received));
                }
                collected.extend_from_slice(&data);
            }
        }
        Ok(Bytes::from(collected))
    }

    fn respond(&self, outcome: Outcome) -> Response<BoxBody<Bytes, RelayError>> {
        let mut response = match &outcome {
            Outcome::Acked { .. } => make_empty_response(StatusCode::OK),
            Outcome::Malformed(_) => {
                make_boxed_response(StatusCode::BAD_REQUEST, "Malformed push envelope.")
            }
            Outcome::InsertFailed { .. } => make_boxed_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to stream the event to {}.", self.relay.sink_name()),
            ),
        };

        if let Some(traceparent) = outcome.traceparent()
            && let Ok(value) = HeaderValue::from_str(traceparent)
        {
            response.headers_mut().insert(TRACEPARENT_HEADER, value);
        }
        response
    }
}

fn method_not_allowed(allow: &'static str) -> Response<BoxBody<Bytes, RelayError>> {
    let mut response = make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allow));
    response
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = RelayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.route(req).await) })
    }
}
