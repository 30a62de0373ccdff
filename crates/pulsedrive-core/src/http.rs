//! Plain-text HTTP control endpoint
//!
//! Every route is a zero-argument trigger: the request line is parsed, the
//! path is matched against a fixed table and a short `text/plain` body is
//! written back. Headers and bodies sent by the client are read past but
//! otherwise ignored.

use core::fmt::Write as _;

use embedded_io_async::{Read, Write};
use heapless::String;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::PulseProfile;
use crate::motor::{Direction, MotorControl};
use crate::scheduler::{PulseScheduler, ScheduleError};

/// Largest request head we buffer before answering
pub const MAX_REQUEST_SIZE: usize = 1024;

/// Capacity of a response body
pub const MAX_BODY_SIZE: usize = 96;

pub type Body = String<MAX_BODY_SIZE>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed request line")]
    Malformed,
    #[error("request head exceeds {MAX_REQUEST_SIZE} bytes")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Other,
}

impl Method {
    fn parse(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            _ => Self::Other,
        }
    }
}

/// Method and path of a request; the query string is dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
}

impl<'a> Request<'a> {
    /// Parse the request line out of a buffered request head
    pub fn parse(head: &'a [u8]) -> Result<Self, HttpError> {
        let line_end = head
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(head.len());
        let line = core::str::from_utf8(&head[..line_end]).map_err(|_| HttpError::Malformed)?;

        let mut parts = line.split_ascii_whitespace();
        let method = parts.next().ok_or(HttpError::Malformed)?;
        let target = parts.next().ok_or(HttpError::Malformed)?;
        let version = parts.next().ok_or(HttpError::Malformed)?;

        if !version.starts_with("HTTP/1.") || !target.starts_with('/') {
            return Err(HttpError::Malformed);
        }

        let path = target.split_once('?').map_or(target, |(path, _)| path);

        Ok(Self {
            method: Method::parse(method),
            path,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    Conflict,
    InternalServerError,
}

impl Status {
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Conflict => 409,
            Self::InternalServerError => 500,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::Conflict => "Conflict",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: Body,
}

impl Response {
    pub fn new(status: Status, text: &str) -> Self {
        let mut body = Body::new();
        push_truncated(&mut body, text);
        Self { status, body }
    }

    pub fn ok(text: &str) -> Self {
        Self::new(Status::Ok, text)
    }

    /// Status line and headers, ready to be written before the body
    pub fn head(&self) -> String<192> {
        let mut head = String::new();
        // 192 bytes always fit this header block
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\n\
             Content-Type: text/plain\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Connection: close\r\n\
             Content-Length: {}\r\n\
             \r\n",
            self.status.code(),
            self.status.reason(),
            self.body.len()
        );
        head
    }
}

fn push_truncated<const N: usize>(buf: &mut String<N>, text: &str) {
    for ch in text.chars() {
        if buf.push(ch).is_err() {
            break;
        }
    }
}

/// Routes understood by the control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Root,
    Enable(Direction),
    Status,
}

impl Route {
    pub fn resolve(path: &str) -> Option<Self> {
        match path {
            "/" => Some(Self::Root),
            "/ena_f" | "/forward" => Some(Self::Enable(Direction::Forward)),
            "/ena_r" | "/reverse" => Some(Self::Enable(Direction::Reverse)),
            "/status" => Some(Self::Status),
            _ => None,
        }
    }
}

/// Binds routes to motor actions
///
/// Knows nothing about the Wi-Fi link; it is served on whatever interface
/// happens to be up.
pub struct ControlService<'a, M: ?Sized> {
    service_name: &'a str,
    motor: &'a M,
    scheduler: &'a PulseScheduler,
    profile: PulseProfile,
}

impl<'a, M> ControlService<'a, M>
where
    M: MotorControl + ?Sized,
{
    pub fn new(
        service_name: &'a str,
        motor: &'a M,
        scheduler: &'a PulseScheduler,
        profile: PulseProfile,
    ) -> Self {
        Self {
            service_name,
            motor,
            scheduler,
            profile,
        }
    }

    /// Handle one request synchronously
    pub fn handle(&self, request: &Request<'_>) -> Response {
        let Some(route) = Route::resolve(request.path) else {
            let mut body = Body::new();
            push_truncated(&mut body, "Not found: ");
            push_truncated(&mut body, request.path);
            return Response {
                status: Status::NotFound,
                body,
            };
        };

        if request.method != Method::Get {
            return Response::new(Status::MethodNotAllowed, "Method Not Allowed");
        }

        match route {
            Route::Root => {
                let mut body = Body::new();
                push_truncated(&mut body, self.service_name);
                push_truncated(&mut body, " Web Server");
                Response::ok(&body)
            }
            Route::Enable(direction) => self.enable(direction),
            Route::Status => {
                let state = self.motor.state();
                if state.enabled {
                    let mut body = Body::new();
                    push_truncated(&mut body, "Running ");
                    push_truncated(&mut body, state.direction.label());
                    Response::ok(&body)
                } else {
                    Response::ok("Idle")
                }
            }
        }
    }

    fn enable(&self, direction: Direction) -> Response {
        match self
            .scheduler
            .start_pulse_job(self.motor, direction, self.profile)
        {
            Ok(_) => match direction {
                Direction::Forward => Response::ok("Motor Forward"),
                Direction::Reverse => Response::ok("Motor Reverse"),
            },
            Err(ScheduleError::Busy) => Response::new(Status::Conflict, "Motor Busy"),
            Err(ScheduleError::Motor(e)) => {
                warn!("Motor {} request failed: {}", direction.label(), e);
                Response::new(Status::InternalServerError, "Motor Fault")
            }
        }
    }
}

/// Read one request from `conn`, answer it and return.
///
/// The caller closes the connection afterwards (`Connection: close`).
pub async fn serve_connection<C, M>(
    conn: &mut C,
    service: &ControlService<'_, M>,
) -> Result<(), C::Error>
where
    C: Read + Write,
    M: MotorControl + ?Sized,
{
    let mut buf = [0u8; MAX_REQUEST_SIZE];
    let mut total = 0usize;

    loop {
        let n = conn.read(&mut buf[total..]).await?;
        if n == 0 {
            if total == 0 {
                return Ok(());
            }
            break;
        }
        total += n;
        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if total >= MAX_REQUEST_SIZE {
            break;
        }
    }

    let response = match Request::parse(&buf[..total]) {
        Ok(request) => {
            let response = service.handle(&request);
            info!(
                "{:?} {} -> {}",
                request.method,
                request.path,
                response.status.code()
            );
            response
        }
        Err(e) => {
            let e = if total >= MAX_REQUEST_SIZE {
                HttpError::TooLarge
            } else {
                e
            };
            debug!("Rejecting request: {}", e);
            Response::new(Status::BadRequest, "Bad Request")
        }
    };

    conn.write_all(response.head().as_bytes()).await?;
    conn.write_all(response.body.as_bytes()).await?;
    conn.flush().await
}
