use std::collections::HashMap;

use async_trait::async_trait;
use loomcore::{
    BodyType, HttpMethod, NodeConfig, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput,
    Value,
};

use crate::capability::{classify_status, classify_transport};

/// Performs an HTTP request with every configured piece (url, headers,
/// params, body) rendered against the variable store. Non-success
/// statuses fail the node so the retry policy can classify them.
pub struct ApiExecutor {
    client: reqwest::Client,
}

impl ApiExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn method_of(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

#[async_trait]
impl NodeExecutor for ApiExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Api
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Api(config) = &ctx.node.config else {
            return Err(NodeError::Config("api node with non-api config".into()));
        };

        let url = ctx.render(&config.url);
        let mut request = self.client.request(method_of(config.method), &url);

        if !config.params.is_empty() {
            let params: Vec<(String, String)> = config
                .params
                .iter()
                .map(|kv| (ctx.render(&kv.key), ctx.render(&kv.value)))
                .collect();
            request = request.query(&params);
        }
        for kv in &config.headers {
            request = request.header(ctx.render(&kv.key), ctx.render(&kv.value));
        }

        request = match config.body_type {
            BodyType::None => request,
            BodyType::Json => {
                let raw = ctx.render(config.body.as_deref().unwrap_or("{}"));
                let parsed: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                    NodeError::Config(format!("request body is not valid JSON: {e}"))
                })?;
                request.json(&parsed)
            }
            BodyType::Raw => request.body(ctx.render(config.body.as_deref().unwrap_or(""))),
            BodyType::FormUrlEncoded => {
                let form: Vec<(String, String)> = config
                    .form_url_encoded
                    .iter()
                    .map(|kv| (ctx.render(&kv.key), ctx.render(&kv.value)))
                    .collect();
                request.form(&form)
            }
        };

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status().as_u16();
        ctx.events
            .info(format!("{} {} -> {}", config.method.as_str(), url, status));
        if let Some(error) = classify_status(status) {
            return Err(error);
        }

        let headers: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let body = response.text().await.map_err(classify_transport)?;

        Ok(NodeOutput::new()
            .with_output("body", body)
            .with_output("status_code", status)
            .with_output("headers", Value::Object(headers)))
    }
}
