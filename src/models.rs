use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Progress of a link issuance, reported for user feedback only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preparing,
    Securing,
    Finalizing,
    Complete,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Preparing => "Preparing your panorama...",
            Stage::Securing => "Securing your content...",
            Stage::Finalizing => "Almost there...",
            Stage::Complete => "Ready to share!",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Preparing => write!(f, "preparing"),
            Stage::Securing => write!(f, "securing"),
            Stage::Finalizing => write!(f, "finalizing"),
            Stage::Complete => write!(f, "complete"),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Maximum upload size in bytes
    pub max_upload_size: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SignInRequest {
    #[schema(example = "alice")]
    pub uid: String,
    pub secret: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SignInResponse {
    /// Bearer token for subsequent requests
    #[schema(example = "6f1c0a3e9b2d4c8e8a7f5d3b1e0c9a2f")]
    pub token: String,
    pub uid: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SignOutResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PrincipalResponse {
    pub uid: String,
    pub signed_in_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadResponse {
    /// Shareable link that opens the 360° viewer
    #[schema(example = "https://viewer-3d.vercel.app/view/3f9a1c...")]
    pub link: String,

    /// Opaque token embedded in the link
    pub token: String,

    /// Stages the issuance went through, in order
    pub stages: Vec<Stage>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResolveResponse {
    /// Proxied URL the viewer fetches the panorama from
    #[schema(example = "https://viewer-3d.vercel.app/3d/3d-views/alice/1700000000000-pano.jpg")]
    pub viewer_url: String,
}
