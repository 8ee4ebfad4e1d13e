use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use crate::registry::Tracker;
use crate::{error, report};

const TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta http-equiv="Content-Type" content="text/html; charset=utf-8">
  <title>{TITLE}</title>
</head>
<body>
  <div id="header">
    <h2>{TITLE}</h2>
  </div>
  <div id="content">
    <p>{USAGE}</p>
    <p>{REPORT}</p>
    <pre>{SETTINGS}</pre>
  </div>
</body>
</html>
"#;

/// Spawns the accept loop on a detached worker thread.
///
/// The thread is never joined; closing its socket on process exit is
/// sufficient. Failure to start the thread is fatal: the host asked for the
/// endpoint, and continuing would silently drop every future request.
pub(crate) fn spawn(tracker: &'static Tracker) {
  let port = tracker.config().webserver_port;
  let spawned = thread::Builder::new()
    .name("leakscope-status".to_string())
    .spawn(move || {
      if let Err(err) = serve(tracker, port) {
        log::error!("status endpoint on port {port} failed: {err}");
      }
    });

  if let Err(err) = spawned {
    error::fail(&format!(
      "could not start status endpoint thread: {err}"
    ));
  }
}

fn serve(tracker: &'static Tracker, port: u16) -> io::Result<()> {
  let listener = TcpListener::bind(("0.0.0.0", port))?;
  log::info!("status endpoint listening on port {port}");

  for stream in listener.incoming() {
    let Ok(stream) = stream else {
      continue;
    };

    if let Err(err) = handle(tracker, stream) {
      log::debug!("status request failed: {err}");
    }
  }

  Ok(())
}

fn handle(tracker: &Tracker, mut stream: TcpStream) -> io::Result<()> {
  let mut first_line = String::new();
  BufReader::new(&mut stream).read_line(&mut first_line)?;

  match request_path(&first_line).unwrap_or("/") {
    "/report" => {
      if let Ok(path) = tracker.report() {
        let _ = report::view(&path);
      }

      let body = render_page(
        tracker,
        "<p>generating leak report (may take a while)</p>",
      );
      respond(&mut stream, "text/html; charset=UTF-8", &body)
    }
    "/stats" => match serde_json::to_string(&tracker.summary()) {
      Ok(body) => {
        respond(&mut stream, "application/json; charset=UTF-8", &body)
      }
      Err(err) => Err(io::Error::other(err)),
    },
    _ => {
      let body = render_page(
        tracker,
        r#"<a href="/report">generate leak report (may take a while)</a>"#,
      );
      respond(&mut stream, "text/html; charset=UTF-8", &body)
    }
  }
}

/// Extracts the path from an HTTP request line such as `GET / HTTP/1.1`.
fn request_path(line: &str) -> Option<&str> {
  let mut parts = line.split_whitespace();
  let _method = parts.next()?;
  let path = parts.next()?;

  path.starts_with('/').then_some(path)
}

fn render_page(tracker: &Tracker, report_fragment: &str) -> String {
  let stats = tracker.summary();
  let usage = format!(
    "highest peak: {} KiB // in use: {} KiB // num leaks: {}",
    stats.peak / 1024,
    stats.usage / 1024,
    stats.leaks,
  );

  TEMPLATE
    .replace("{TITLE}", concat!(env!("CARGO_PKG_NAME"), " status"))
    .replace("{USAGE}", &usage)
    .replace("{REPORT}", report_fragment)
    .replace("{SETTINGS}", &tracker.config().to_string())
}

fn respond<W: Write>(
  out: &mut W,
  content_type: &str,
  body: &str,
) -> io::Result<()> {
  write!(
    out,
    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\n\
     Content-Length: {}\r\n\r\n{body}",
    body.len(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_path_parses_the_first_line() {
    assert_eq!(request_path("GET / HTTP/1.1\r\n"), Some("/"));
    assert_eq!(request_path("GET /report HTTP/1.1\r\n"), Some("/report"));
    assert_eq!(request_path("GET /stats HTTP/1.1"), Some("/stats"));
    assert_eq!(request_path(""), None);
    assert_eq!(request_path("GARBAGE"), None);
  }

  #[test]
  fn status_page_shows_stats_and_settings() {
    let tracker = Tracker::new();
    tracker.watch(0x1000, 4096);

    let page = render_page(&tracker, "fragment");
    assert!(page.contains("in use: 4 KiB"));
    assert!(page.contains("num leaks: 1"));
    assert!(page.contains("max_frames=128"));
    assert!(page.contains("fragment"));
  }

  #[test]
  fn responses_carry_a_content_length() {
    let mut out = Vec::new();
    respond(&mut out, "text/html; charset=UTF-8", "hello").unwrap();

    let response = String::from_utf8(out).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.ends_with("\r\n\r\nhello"));
  }
}
