pub(crate) use crate::error::{Error, Result};
pub(crate) use reqwest::{Method, Response, Url};
pub(crate) use serde::Serialize;
pub(crate) use serde_json::Value;

pub mod tts;

type QueryValues = Vec<(&'static str, String)>;

#[derive(Debug)]
pub enum RequestBody {
    Json(Value),
    Empty,
}

#[allow(async_fn_in_trait)]
pub trait ElevenLabsEndpoint {
    const PATH: &'static str;

    const METHOD: Method;

    type ResponseBody;

    fn query_params(&self) -> Option<QueryValues> {
        None
    }

    fn path_params(&self) -> Vec<(&'static str, &str)> {
        vec![]
    }

    fn request_body(&self) -> Result<RequestBody> {
        Ok(RequestBody::Empty)
    }

    async fn response_body(self, resp: Response) -> Result<Self::ResponseBody>;

    fn url(&self, base_url: &str) -> Result<Url> {
        let mut url = base_url.parse::<Url>().map_err(|e| {
            Error::InvalidRequest(format!("failed to parse base URL '{base_url}': {e}"))
        })?;

        let mut path = Self::PATH.to_string();

        for (placeholder, id) in self.path_params() {
            path = path.replace(placeholder, id);
        }

        url.set_path(&path);

        if let Some(query_params) = self.query_params() {
            url.query_pairs_mut().extend_pairs(query_params);
        }

        Ok(url)
    }
}
