use chrono::Local;

const SERVER: &'static str = "httpd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Forbidden,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    fn line(&self) -> &'static str {
        match *self {
            Status::Ok => "HTTP/1.1 200 OK",
            Status::Forbidden => "HTTP/1.1 403 Forbidden",
            Status::NotFound => "HTTP/1.1 404 Not Found",
            Status::MethodNotAllowed => "HTTP/1.1 405 Method Not Allowed",
        }
    }
}

/// The headers every response carries.
fn common_headers(status: Status) -> String {
    format!(
        "\
         {}\r\n\
         Connection: close\r\n\
         Server: {}\r\n\
         Date: {}\r\n",
        status.line(),
        SERVER,
        Local::now().format("%a %b %e %H:%M:%S %Y"),
    )
}

/// A response with no content headers and no body.
pub fn empty(status: Status) -> Vec<u8> {
    let mut response = common_headers(status);
    response.push_str("\r\n");
    response.into_bytes()
}

/// Return a HTTP 200 response for `body`. The body itself is only included when `with_body` is
/// set, so HEAD gets the same headers as GET.
pub fn ok(content_type: &str, body: &[u8], with_body: bool) -> Vec<u8> {
    let mut response = common_headers(Status::Ok);
    response.push_str(&format!(
        "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type,
        body.len()
    ));

    let mut response = response.into_bytes();
    if with_body {
        response.extend_from_slice(body);
    }
    response
}
