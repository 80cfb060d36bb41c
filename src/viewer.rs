//! Viewer collaborator and the HTML pages around it.
//!
//! The panorama renderer itself is Photo Sphere Viewer running in the
//! browser; the server only emits a page that points it at a fetchable URL.

/// Presentation knobs handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerOptions {
    pub width: String,
    pub height: String,
    pub loading_img: Option<String>,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            width: "100%".to_string(),
            height: "100vh".to_string(),
            loading_img: None,
        }
    }
}

pub trait Viewer: Send + Sync {
    /// Produce an interactive view of the image at `url`.
    fn render(&self, url: &str, options: &ViewerOptions) -> String;
}

const PSV_VERSION: &str = "4.8.1";
const THREE_VERSION: &str = "0.147.0";
const UEVENT_VERSION: &str = "2.2.0";

/// Bootstrap script served at `/viewer.js`; reads its settings from the container's data attributes.
pub const VIEWER_JS: &str = r#"(function () {
  var el = document.getElementById("viewer");
  if (!el || !window.PhotoSphereViewer) { return; }
  var options = { container: el, panorama: el.dataset.src, navbar: ["zoom", "move", "fullscreen"] };
  if (el.dataset.loadingImg) { options.loadingImg = el.dataset.loadingImg; }
  new PhotoSphereViewer.Viewer(options);
})();
"#;

/// Photo Sphere Viewer loaded from jsDelivr.
#[derive(Debug, Clone, Default)]
pub struct PhotoSphereViewer;

impl Viewer for PhotoSphereViewer {
    fn render(&self, url: &str, options: &ViewerOptions) -> String {
        let loading_img = options
            .loading_img
            .as_deref()
            .map(|img| format!(r#" data-loading-img="{}""#, escape_html(img)))
            .unwrap_or_default();

        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>360° view</title>
<link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/photo-sphere-viewer@{psv}/dist/photo-sphere-viewer.min.css">
<style>html, body {{ margin: 0; height: 100%; }}</style>
</head>
<body>
<div id="viewer" style="width: {width}; height: {height};" data-src="{src}"{loading_img}></div>
<script src="https://cdn.jsdelivr.net/npm/three@{three}/build/three.min.js"></script>
<script src="https://cdn.jsdelivr.net/npm/uevent@{uevent}/browser.min.js"></script>
<script src="https://cdn.jsdelivr.net/npm/photo-sphere-viewer@{psv}/dist/photo-sphere-viewer.min.js"></script>
<script src="/viewer.js"></script>
</body>
</html>
"#,
            psv = PSV_VERSION,
            three = THREE_VERSION,
            uevent = UEVENT_VERSION,
            width = escape_html(&options.width),
            height = escape_html(&options.height),
            src = escape_html(url),
            loading_img = loading_img,
        )
    }
}

/// Error page with a retry link back to the same view.
pub fn error_page(message: &str, retry_href: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Something went wrong</title></head>
<body>
<h3>Oops! Something went wrong</h3>
<p>{message}</p>
<p><a href="{retry}">Try Again</a></p>
</body>
</html>
"#,
        message = escape_html(message),
        retry = escape_html(retry_href),
    )
}

pub fn not_found_page() -> String {
    r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Not found</title></head>
<body>
<h3>404: this view does not exist</h3>
</body>
</html>
"#
    .to_string()
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_points_the_viewer_at_the_url() {
        let html = PhotoSphereViewer.render(
            "https://viewer-3d.vercel.app/3d/3d-views/alice/1-pano.jpg",
            &ViewerOptions::default(),
        );

        assert!(html.contains(
            r#"data-src="https://viewer-3d.vercel.app/3d/3d-views/alice/1-pano.jpg""#
        ));
        assert!(html.contains("width: 100%; height: 100vh;"));
        assert!(html.contains(r#"<script src="/viewer.js"></script>"#));
        assert!(!html.contains("data-loading-img"));
    }

    #[test]
    fn render_escapes_attribute_values() {
        let options = ViewerOptions {
            loading_img: Some("/loading.gif?a=1&b=2".to_string()),
            ..ViewerOptions::default()
        };
        let html = PhotoSphereViewer.render(r#"https://x/"><script>alert(1)</script>"#, &options);

        assert!(!html.contains("<script>alert(1)</script>"));
        assert!(html.contains("&quot;&gt;&lt;script&gt;"));
        assert!(html.contains(r#"data-loading-img="/loading.gif?a=1&amp;b=2""#));
    }

    #[test]
    fn error_page_offers_retry() {
        let html = error_page("Invalid URL-token is not valid hex", "/view/abc");
        assert!(html.contains("Invalid URL-token is not valid hex"));
        assert!(html.contains(r#"<a href="/view/abc">Try Again</a>"#));
    }
}
