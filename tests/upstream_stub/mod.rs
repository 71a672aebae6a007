#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sa_findings::fetch::{FetchError, PageSource, RawPage};
use sa_findings::key::{Key, State, Target};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct StubRequest {
    pub query: BTreeMap<String, String>,
    pub received_at: Instant,
}

impl StubRequest {
    pub fn param(&self, name: &str) -> &str {
        self.query.get(name).map(String::as_str).unwrap_or("")
    }
}

/// HTTP stand-in for the report endpoint, served at `{base_url}`.
pub struct UpstreamStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl UpstreamStub {
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&StubRequest) -> (u16, String) + Send + 'static,
    {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start upstream stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/netnrega/SA-GPReport.aspx");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(20)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = url::Url::parse(&format!("http://stub{}", request.url()))
                    .expect("parse stub request url");
                let stub_request = StubRequest {
                    query: url.query_pairs().into_owned().collect(),
                    received_at: Instant::now(),
                };
                seen.lock().expect("lock requests").push(stub_request.clone());

                let (status, body) = handler(&stub_request);
                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    &b"text/html; charset=utf-8"[..],
                )
                .expect("build header");
                let response = tiny_http::Response::from_string(body)
                    .with_status_code(status)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn requests(&self) -> Vec<StubRequest> {
        self.requests.lock().expect("lock requests").clone()
    }
}

impl Drop for UpstreamStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn listing_html(units: &[&str]) -> String {
    if units.is_empty() {
        return "<html><body><span>No Record Found</span></body></html>".to_owned();
    }
    let links = units
        .iter()
        .map(|unit| {
            format!(
                r#"<tr><td><a href="SA-GPReport.aspx?page=GP&amp;lflag=eng&amp;district_name=THRISSUR&amp;block_name=ANTHIKAD&amp;panchayat_code={unit}">Panchayat {unit}</a></td></tr>"#
            )
        })
        .collect::<String>();
    format!(
        r#"<!doctype html>
<html><body>
<h2>Gram Panchayats</h2>
<table>{links}</table>
</body></html>
"#
    )
}

/// A findings page with one row per `(category, finding, amount)`.
pub fn findings_html(rows: &[(&str, &str, &str)]) -> String {
    findings_page("", rows)
}

/// A findings page whose gram sabha selector offers `dates` (value and label alike).
pub fn findings_html_with_dates(dates: &[&str], rows: &[(&str, &str, &str)]) -> String {
    let options = dates
        .iter()
        .map(|date| format!(r#"<option value="{date}">{date}</option>"#))
        .collect::<String>();
    let select = format!(
        r#"<select id="ctl00_ContentPlaceHolder1_ddlGSDate"><option value="0">--Select--</option>{options}</select>"#
    );
    findings_page(&select, rows)
}

fn findings_page(form: &str, rows: &[(&str, &str, &str)]) -> String {
    let body = rows
        .iter()
        .enumerate()
        .map(|(idx, (category, finding, amount))| {
            format!(
                "<tr><td>{}</td><td>{category}</td><td>{finding}</td><td>{amount}</td></tr>",
                idx + 1
            )
        })
        .collect::<String>();
    format!(
        r#"<!doctype html>
<html><body>
{form}
<table id="layout"><tr><td>
  <span>Social Audit Findings</span>
  <table border="1">
    <tr><th>S.No</th><th>Issue Category</th><th>Issue Description</th><th>Amount (Rs.)</th></tr>
    {body}
  </table>
</td></tr></table>
</body></html>
"#
    )
}

#[derive(Debug, Clone)]
pub enum Response {
    Html(String),
    NotFound,
    Unavailable,
}

/// In-memory [`PageSource`] for driver tests.
#[derive(Default)]
pub struct FakeUpstream {
    listings: HashMap<(State, u16), Response>,
    pages: HashMap<Key, Response>,
    gram_sabhas: HashMap<(Key, String), Response>,
    fetched: Mutex<Vec<Key>>,
    fetched_gram_sabhas: Mutex<Vec<(Key, String)>>,
    interrupt: Option<(Key, Arc<Notify>)>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listing(self, state: State, year: u16, units: &[&str]) -> Self {
        self.listing_response(state, year, Response::Html(listing_html(units)))
    }

    pub fn listing_response(mut self, state: State, year: u16, response: Response) -> Self {
        self.listings.insert((state, year), response);
        self
    }

    pub fn page(self, key: Key, rows: &[(&str, &str, &str)]) -> Self {
        self.page_response(key, Response::Html(findings_html(rows)))
    }

    pub fn page_response(mut self, key: Key, response: Response) -> Self {
        self.pages.insert(key, response);
        self
    }

    pub fn gram_sabha(mut self, key: Key, date: &str, response: Response) -> Self {
        self.gram_sabhas.insert((key, date.to_owned()), response);
        self
    }

    /// Notifies `notify` when `key` is fetched.
    pub fn interrupt_on(mut self, key: Key, notify: Arc<Notify>) -> Self {
        self.interrupt = Some((key, notify));
        self
    }

    pub fn fetched(&self) -> Vec<Key> {
        self.fetched.lock().expect("lock fetched").clone()
    }

    pub fn fetched_gram_sabhas(&self) -> Vec<(Key, String)> {
        self.fetched_gram_sabhas.lock().expect("lock fetched").clone()
    }
}

fn respond(target: Target, response: Option<&Response>) -> Result<RawPage, FetchError> {
    match response {
        Some(Response::Html(html)) => Ok(RawPage {
            target,
            html: html.clone(),
            fetched_at: chrono::Utc::now(),
            status: 200,
        }),
        Some(Response::Unavailable) => Err(FetchError::Unavailable {
            target,
            attempts: 3,
            reason: "HTTP 503 Service Unavailable".to_owned(),
        }),
        Some(Response::NotFound) | None => Err(FetchError::NotFound {
            target,
            status: 404,
        }),
    }
}

#[async_trait]
impl PageSource for FakeUpstream {
    async fn fetch_listing(&self, state: State, year: u16) -> Result<RawPage, FetchError> {
        respond(
            Target::Listing { state, year },
            self.listings.get(&(state, year)),
        )
    }

    async fn fetch(&self, key: &Key) -> Result<RawPage, FetchError> {
        self.fetched.lock().expect("lock fetched").push(key.clone());
        if let Some((trigger, notify)) = &self.interrupt {
            if trigger == key {
                notify.notify_one();
            }
        }
        respond(Target::GpYear(key.clone()), self.pages.get(key))
    }

    async fn fetch_gram_sabha(&self, key: &Key, date: &str) -> Result<RawPage, FetchError> {
        let wanted = (key.clone(), date.to_owned());
        self.fetched_gram_sabhas
            .lock()
            .expect("lock fetched")
            .push(wanted.clone());
        let response = self.gram_sabhas.get(&wanted);
        let (key, date) = wanted;
        respond(Target::GramSabha { key, date }, response)
    }
}
