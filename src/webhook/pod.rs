//! Pod Mutation Webhook
//!
//! Handles AdmissionReview requests for Pod creation by delegating to the
//! configured [`PodMutator`](crate::mutation::PodMutator).

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use tracing::{error, info};

use crate::mutation::review;

use super::WebhookState;

/// Handle a mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    info!(
        uid = %req.uid,
        namespace = ?req.namespace,
        pod = %req.name,
        dry_run = req.dry_run,
        "Admission review for pod"
    );

    let response = review(state.mutator.as_ref(), &req).await;
    Json(response.into_review())
}
