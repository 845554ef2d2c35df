//! Scripted HTTP upstream on a loopback port.
//!
//! Each path answers from its own queue of `(status, body)` replies; the last
//! reply repeats once the queue is down to one. Unscripted paths answer 404.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

/// One request as the upstream saw it.
#[derive(Debug, Clone)]
pub struct Hit {
    pub path: String,
    pub query: String,
    pub body: String,
}

#[derive(Default)]
struct Script {
    replies: HashMap<String, VecDeque<(u16, String)>>,
    hits: Vec<Hit>,
}

#[derive(Clone)]
pub struct StubServer {
    script: Arc<Mutex<Script>>,
    base_url: String,
}

impl StubServer {
    /// Bind to an ephemeral port and serve on the current actix runtime.
    pub fn start() -> Self {
        let script = Arc::new(Mutex::new(Script::default()));
        let data = web::Data::from(Arc::clone(&script));
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .default_service(web::to(answer))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .expect("bind stub upstream");
        let addr = server.addrs()[0];
        actix_rt::spawn(server.run());

        Self {
            script,
            base_url: format!("http://{addr}"),
        }
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    /// Queue a reply for `path`.
    pub fn reply(&self, path: &str, status: u16, body: &str) -> &Self {
        self.script
            .lock()
            .unwrap()
            .replies
            .entry(path.to_string())
            .or_default()
            .push_back((status, body.to_string()));
        self
    }

    /// Replace everything queued for `path` with a single reply.
    pub fn set_reply(&self, path: &str, status: u16, body: &str) {
        let mut script = self.script.lock().unwrap();
        let queue = script.replies.entry(path.to_string()).or_default();
        queue.clear();
        queue.push_back((status, body.to_string()));
    }

    pub fn hits(&self, path: &str) -> Vec<Hit> {
        self.script
            .lock()
            .unwrap()
            .hits
            .iter()
            .filter(|h| h.path == path)
            .cloned()
            .collect()
    }
}

async fn answer(
    req: HttpRequest,
    body: web::Bytes,
    script: web::Data<Mutex<Script>>,
) -> HttpResponse {
    let mut script = script.lock().unwrap();
    script.hits.push(Hit {
        path: req.path().to_string(),
        query: req.query_string().to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let reply = match script.replies.get_mut(req.path()) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
    };
    match reply {
        Some((status, body)) => {
            HttpResponse::build(StatusCode::from_u16(status).unwrap_or(StatusCode::IM_A_TEAPOT))
                .content_type("application/json")
                .body(body)
        }
        None => HttpResponse::NotFound().finish(),
    }
}
