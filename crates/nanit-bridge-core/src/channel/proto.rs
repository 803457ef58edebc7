//! Control-channel wire format.
//!
//! Each WebSocket binary message carries exactly one protobuf (proto2)
//! envelope. Only the fields the bridge reads or writes are declared here;
//! the decoder skips everything else the camera sends.

use prost::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Keepalive = 0,
    Request = 1,
    Response = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    PutSensorData = 1,
    GetSensorData = 2,
    GetUcTokens = 3,
    PutUcTokens = 4,
    PutSettings = 5,
    GetSettings = 6,
    PutStreaming = 7,
    GetControl = 8,
    PutControl = 9,
    GetStatus = 10,
    PutStatus = 11,
    GetLogs = 12,
}

/// Which consumer a stream is for. The bridge poses as the mobile viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StreamIdentifier {
    Dvr = 0,
    Analytics = 1,
    Mobile = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StreamingStatus {
    Started = 0,
    Stopped = 1,
    Paused = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct Streaming {
    #[prost(enumeration = "StreamIdentifier", required, tag = "1")]
    pub id: i32,
    #[prost(enumeration = "StreamingStatus", required, tag = "2")]
    pub status: i32,
    #[prost(string, required, tag = "3")]
    pub rtmp_url: String,
    #[prost(int32, optional, tag = "4")]
    pub attempts: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(int32, required, tag = "1")]
    pub id: i32,
    #[prost(enumeration = "RequestType", required, tag = "2")]
    pub r#type: i32,
    #[prost(message, optional, tag = "4")]
    pub streaming: Option<Streaming>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(int32, required, tag = "1")]
    pub request_id: i32,
    #[prost(enumeration = "RequestType", required, tag = "2")]
    pub request_type: i32,
    #[prost(int32, required, tag = "3")]
    pub status_code: i32,
    #[prost(string, optional, tag = "4")]
    pub status_message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(enumeration = "MessageType", required, tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub request: Option<Request>,
    #[prost(message, optional, tag = "3")]
    pub response: Option<Response>,
}

/// A decoded control-channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Keepalive,
    Request(Request),
    Response(Response),
    /// Envelope whose type is unrecognised or whose body is missing
    Unknown(i32),
}

impl Frame {
    pub fn decode(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        let envelope = Envelope::decode(bytes)?;
        let frame = match MessageType::try_from(envelope.r#type) {
            Ok(MessageType::Keepalive) => Frame::Keepalive,
            Ok(MessageType::Request) => envelope
                .request
                .map(Frame::Request)
                .unwrap_or(Frame::Unknown(envelope.r#type)),
            Ok(MessageType::Response) => envelope
                .response
                .map(Frame::Response)
                .unwrap_or(Frame::Unknown(envelope.r#type)),
            Err(_) => Frame::Unknown(envelope.r#type),
        };
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let envelope = match self {
            Frame::Keepalive => Envelope {
                r#type: MessageType::Keepalive.into(),
                request: None,
                response: None,
            },
            Frame::Request(request) => Envelope {
                r#type: MessageType::Request.into(),
                request: Some(request.clone()),
                response: None,
            },
            Frame::Response(response) => Envelope {
                r#type: MessageType::Response.into(),
                request: None,
                response: Some(response.clone()),
            },
            Frame::Unknown(kind) => Envelope {
                r#type: *kind,
                request: None,
                response: None,
            },
        };
        envelope.encode_to_vec()
    }

    /// `PUT_STREAMING` asking the camera to push its mobile stream to `ingest_url`.
    pub fn start_streaming(request_id: i32, ingest_url: &str) -> Self {
        Frame::Request(Request {
            id: request_id,
            r#type: RequestType::PutStreaming.into(),
            streaming: Some(Streaming {
                id: StreamIdentifier::Mobile.into(),
                status: StreamingStatus::Started.into(),
                rtmp_url: ingest_url.to_string(),
                attempts: Some(1),
            }),
        })
    }
}

/// Readable request type name for logs
pub fn request_type_name(raw: i32) -> String {
    RequestType::try_from(raw)
        .map(|t| format!("{:?}", t))
        .unwrap_or_else(|_| format!("Unknown({})", raw))
}
