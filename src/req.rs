use std::time::Duration;

use crate::{
    api::Problem,
    error::{Result, TransportError},
};

pub(crate) type ReqResult<T> = std::result::Result<T, Problem>;

/// Pooled HTTP client carrying the crate's User-Agent and per-request
/// timeout. One instance is shared per [`Directory`](crate::Directory) so
/// connections are reused across ACME calls.
#[derive(Debug, Clone)]
pub(crate) struct Http {
    client: reqwest::Client,
}

impl Http {
    pub(crate) fn new(user_agent: &str, timeout: Duration) -> Result<Http> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(TransportError::Http)?;

        Ok(Http { client })
    }

    pub(crate) async fn get(&self, url: &str) -> Result<reqwest::Response> {
        log::trace!("GET {url}");
        Ok(self
            .client
            .get(url)
            .send()
            .await
            .map_err(TransportError::Http)?)
    }

    pub(crate) async fn head(&self, url: &str) -> Result<reqwest::Response> {
        log::trace!("HEAD {url}");
        Ok(self
            .client
            .head(url)
            .send()
            .await
            .map_err(TransportError::Http)?)
    }

    pub(crate) async fn post_jose(&self, url: &str, body: &str) -> Result<reqwest::Response> {
        log::trace!("POST {url} {body}");
        Ok(self
            .client
            .post(url)
            .header("content-type", "application/jose+json")
            .body(body.to_owned())
            .send()
            .await
            .map_err(TransportError::Http)?)
    }
}

/// Checks the response status against the caller's allow-list.
///
/// Anything else is turned into a [`Problem`]: a decoded
/// `application/problem+json` body when the server sent one, a synthesized
/// document otherwise. The caller decides what to do with it (the transport
/// recovers `badNonce` once, everything else surfaces).
pub(crate) async fn req_handle_error(
    res: reqwest::Response,
    allowed: &[u16],
) -> ReqResult<reqwest::Response> {
    let status = res.status().as_u16();

    if allowed.contains(&status) {
        return Ok(res);
    }

    let is_problem_json = res
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    let problem = if is_problem_json {
        // if we were sent a problem+json, deserialize it
        let body = req_safe_read_body(res).await;
        let mut problem = serde_json::from_str::<Problem>(&body).unwrap_or_else(|err| Problem {
            _type: "problemJsonFail".into(),
            detail: Some(format!(
                "Failed to deserialize application/problem+json ({err}) body: {body}"
            )),
            ..Problem::default()
        });
        problem.status.get_or_insert(status);
        problem
    } else {
        // some other problem
        let body = req_safe_read_body(res).await;
        Problem {
            _type: "httpReqError".into(),
            detail: Some(format!("{status} body: {body}")),
            status: Some(status),
            subproblems: None,
        }
    };

    Err(problem)
}

pub(crate) fn req_expect_header(res: &reqwest::Response, name: &str) -> ReqResult<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
        .ok_or_else(|| Problem {
            _type: format!("Missing header: {name}"),
            ..Problem::default()
        })
}

pub(crate) async fn req_safe_read_body(res: reqwest::Response) -> String {
    // letsencrypt sometimes closes the TLS abruptly causing io error
    // even though we did capture the body.
    res.text().await.unwrap_or_default()
}
