use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    extractors::auth::AuthSession,
    utils::{
        response::{ApiResponse, AppError, FuncError, response},
        state::ArcAppState,
    },
};

mod complete {
    use std::collections::HashMap;

    use tracing::info;
    use validator::{Validate, ValidationError};

    use super::*;
    use crate::{services::text::PromptTemplate, utils::validate::ValidatedJson};

    fn validate_variables(variables: &HashMap<String, String>) -> Result<(), ValidationError> {
        if variables.len() > 8 {
            return Err(ValidationError::new("too_many_variables"));
        }
        for (name, value) in variables {
            if name.len() > 32 {
                return Err(ValidationError::new("variable_name_too_long"));
            }
            if value.len() > 4000 {
                return Err(ValidationError::new("variable_too_long"));
            }
        }
        Ok(())
    }

    #[derive(Debug, Deserialize, Validate)]
    pub struct Payload {
        #[serde(default)]
        #[validate(custom(function = "validate_variables"))]
        pub variables: HashMap<String, String>,
    }

    // Fill a named prompt and return the model's answer, JSON when possible
    pub async fn handler(
        session: AuthSession,
        State(state): State<ArcAppState>,
        Path(template): Path<String>,
        ValidatedJson(payload): ValidatedJson<Payload>,
    ) -> Result<ApiResponse<Value>, AppError> {
        let text = state.text.as_ref().ok_or(FuncError::AssistUnavailable)?;
        let template = PromptTemplate::find(&template).ok_or(FuncError::UnknownTemplate)?;

        info!("User {} requested {} completion", session.user_id, template.name);
        let answer = text.complete(template, &payload.variables).await?;
        Ok(response(answer, StatusCode::OK))
    }
}

pub fn router() -> Router<ArcAppState> {
    Router::new().route("/{template}", post(complete::handler))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use serde_json::json;

    use crate::endpoints::test_support::{app, call, token};
    use crate::services::text::{TextService, fake::FakeTextService};
    use crate::utils::state::testing::test_state;

    fn with_fake() -> axum::Router {
        let text: Arc<dyn TextService> = Arc::new(FakeTextService::default());
        app(test_state(Some(text)))
    }

    #[tokio::test]
    async fn renders_the_named_template() {
        let app = with_fake();
        let (status, json) = call(
            &app,
            "POST",
            "/v1/assist/chat",
            Some(&token("1001", "s1")),
            Some(json!({ "variables": { "message": "hello" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"], "hello");
    }

    #[tokio::test]
    async fn unknown_template_and_missing_variables() {
        let app = with_fake();
        let auth = token("1001", "s1");
        let (status, json) = call(&app, "POST", "/v1/assist/horoscope", Some(&auth), Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "UNKNOWN_TEMPLATE");

        let (status, json) = call(&app, "POST", "/v1/assist/chat", Some(&auth), Some(json!({}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"], "MISSING_VARIABLE");
    }

    #[tokio::test]
    async fn disabled_without_a_text_service() {
        let app = app(test_state(None));
        let (status, json) = call(
            &app,
            "POST",
            "/v1/assist/chat",
            Some(&token("1001", "s1")),
            Some(json!({ "variables": { "message": "hi" } })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "ASSIST_UNAVAILABLE");
    }
}
