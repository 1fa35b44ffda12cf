//! Webhook step: one templated HTTP call through the [`HttpTransport`].
//!
//! Any 2xx response completes the step with the parsed body. Non-2xx
//! statuses, transport errors and timeouts fail the step with whatever
//! status and body were received kept in the output.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tenure_types::workflow::{StepConfig, StepDefinition};

use crate::workflow::collaborators::{HttpRequest, HttpTransport};
use crate::workflow::step_runner::{StepContext, StepError, StepOutput};

/// Execute a `webhook` step.
pub async fn run_webhook(
    transport: &dyn HttpTransport,
    step: &StepDefinition,
    ctx: &StepContext,
    default_timeout: Duration,
) -> Result<StepOutput, StepError> {
    let StepConfig::Webhook {
        url,
        method,
        headers,
        body,
        timeout_ms,
        output_variable,
    } = &step.config
    else {
        return Err(StepError::Unsupported {
            step_id: step.id.clone(),
            step_type: step.step_type().to_string(),
        });
    };

    if url.trim().is_empty() {
        return Err(StepError::missing(step, "url"));
    }

    let url = ctx.eval.resolve_template(url);
    let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout);
    let request = HttpRequest {
        method: *method,
        url: url.clone(),
        headers: headers
            .iter()
            .map(|(k, v)| (k.clone(), ctx.eval.resolve_template(v)))
            .collect::<HashMap<_, _>>(),
        body: body.as_deref().map(|b| ctx.eval.resolve_template(b)),
        timeout,
    };

    tracing::debug!(
        instance_id = %ctx.instance_id,
        step_id = step.id.as_str(),
        method = method.as_str(),
        url = url.as_str(),
        "calling webhook"
    );

    let response = match tokio::time::timeout(timeout, transport.send(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::warn!(step_id = step.id.as_str(), url = url.as_str(), error = %e, "webhook failed");
            return Ok(StepOutput::fail(
                format!("webhook request failed: {e}"),
                json!({ "url": url, "error": e.to_string() }),
            ));
        }
        Err(_) => {
            let ms = timeout.as_millis() as u64;
            tracing::warn!(step_id = step.id.as_str(), url = url.as_str(), timeout_ms = ms, "webhook timed out");
            return Ok(StepOutput::fail(
                format!("webhook timed out after {ms} ms"),
                json!({ "url": url, "error": "timeout", "timeout_ms": ms }),
            ));
        }
    };

    let parsed = parse_body(&response.body);
    let output = json!({
        "status": response.status,
        "body": parsed,
        "headers": response.headers,
    });

    if !response.is_success() {
        return Ok(StepOutput::fail(
            format!("webhook returned HTTP {}", response.status),
            output,
        ));
    }

    let mut result = StepOutput::continue_with(output);
    if let Some(name) = output_variable {
        result = result.with_variable(name, parsed);
    }
    Ok(result)
}

/// JSON when the body parses, the raw text otherwise.
fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockHttp, step, step_context};
    use tenure_types::workflow::HttpMethod;

    fn webhook(url: &str, timeout_ms: Option<u64>) -> StepDefinition {
        step(
            "notify-payroll",
            3,
            StepConfig::Webhook {
                url: url.to_string(),
                method: HttpMethod::Post,
                headers: HashMap::from([(
                    "X-Employee".to_string(),
                    "{{process.employee_id}}".to_string(),
                )]),
                body: Some(r#"{"employee":"{{process.employee_id}}"}"#.to_string()),
                timeout_ms,
                output_variable: Some("payroll".to_string()),
            },
        )
    }

    #[tokio::test]
    async fn test_success_parses_json_and_sets_variable() {
        let http = MockHttp::responding(201, r#"{"payroll_id": 42}"#);
        let ctx = step_context(json!({"employee_id": "e-1"}));
        let out = run_webhook(
            &http,
            &webhook("https://payroll.example.com/{{process.employee_id}}", None),
            &ctx,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        assert!(!out.is_failure());
        assert_eq!(out.output["status"], 201);
        assert_eq!(out.variables["payroll"], json!({"payroll_id": 42}));

        let sent = http.requests();
        assert_eq!(sent[0].url, "https://payroll.example.com/e-1");
        assert_eq!(sent[0].headers["X-Employee"], "e-1");
        assert_eq!(sent[0].body.as_deref(), Some(r#"{"employee":"e-1"}"#));
    }

    #[tokio::test]
    async fn test_text_body_kept_as_string() {
        let http = MockHttp::responding(200, "ok");
        let out = run_webhook(&http, &webhook("https://x.example.com", None), &step_context(json!({})), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(out.output["body"], "ok");
    }

    #[tokio::test]
    async fn test_non_2xx_fails_with_status() {
        let http = MockHttp::responding(503, "unavailable");
        let out = run_webhook(&http, &webhook("https://x.example.com", None), &step_context(json!({})), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(out.is_failure());
        assert_eq!(out.output["status"], 503);
        assert!(out.error.unwrap().contains("503"));
        assert!(out.variables.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let http = MockHttp::responding(200, "{}").with_delay(Duration::from_millis(200));
        let out = run_webhook(&http, &webhook("https://slow.example.com", Some(10)), &step_context(json!({})), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(out.is_failure());
        assert_eq!(out.output["error"], "timeout");
    }

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let http = MockHttp::default();
        let err = run_webhook(&http, &webhook("  ", None), &step_context(json!({})), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::MissingConfig { .. }));
    }
}
