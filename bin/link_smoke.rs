/**
 * Smoke test for a running panoview server
 * Signs in, uploads a panorama, follows the shareable link and signs out
 */

use reqwest::multipart;
use serde_json::json;
use std::error::Error;
use std::path::Path;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let base_url = std::env::var("TEST_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let uid = std::env::var("TEST_UID").unwrap_or_else(|_| "alice".to_string());
    let secret = std::env::var("TEST_SECRET").unwrap_or_else(|_| "wonderland".to_string());

    println!("🧪 Testing panoview with base URL: {}", base_url);
    println!("{}", "=".repeat(80));

    let client = reqwest::Client::new();

    test_upload_requires_sign_in(&client, &base_url).await?;
    let session = sign_in(&client, &base_url, &uid, &secret).await?;
    test_non_image_rejected(&client, &base_url, &session).await?;
    test_link_round_trip(&client, &base_url, &session).await?;
    test_garbled_token(&client, &base_url).await?;
    sign_out(&client, &base_url, &session).await?;

    println!("\n{}", "=".repeat(80));
    println!("✅ All checks passed!");
    Ok(())
}

async fn test_upload_requires_sign_in(client: &reqwest::Client, base_url: &str) -> Result<(), Box<dyn Error>> {
    println!("\n🔒 TEST: Upload without a session");
    println!("{}", "-".repeat(80));

    let response = client
        .post(format!("{}/api/upload", base_url))
        .multipart(image_form(b"not read".to_vec())?)
        .send()
        .await?;

    if response.status() != reqwest::StatusCode::UNAUTHORIZED {
        return Err(format!("❌ Expected 401, got {}", response.status()).into());
    }
    let body: serde_json::Value = response.json().await?;
    println!("     ✅ Rejected: {}", body["error"]);
    Ok(())
}

async fn sign_in(client: &reqwest::Client, base_url: &str, uid: &str, secret: &str) -> Result<String, Box<dyn Error>> {
    println!("\n🔑 TEST: Sign in as {}", uid);
    println!("{}", "-".repeat(80));

    let response = client
        .post(format!("{}/api/auth/sign-in", base_url))
        .json(&json!({ "uid": uid, "secret": secret }))
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        return Err(format!("❌ Sign-in failed: {}", error_text).into());
    }

    let body: serde_json::Value = response.json().await?;
    let token = body["token"].as_str()
        .ok_or("Missing token in sign-in response")?
        .to_string();
    println!("     ✅ Signed in");
    Ok(token)
}

async fn test_non_image_rejected(client: &reqwest::Client, base_url: &str, session: &str) -> Result<(), Box<dyn Error>> {
    println!("\n📄 TEST: Non-image upload");
    println!("{}", "-".repeat(80));

    let form = multipart::Form::new()
        .part("file", multipart::Part::bytes(b"just text".to_vec())
            .file_name("notes.txt")
            .mime_str("text/plain")?);

    let response = client
        .post(format!("{}/api/upload", base_url))
        .bearer_auth(session)
        .multipart(form)
        .send()
        .await?;

    if response.status() != reqwest::StatusCode::BAD_REQUEST {
        return Err(format!("❌ Expected 400, got {}", response.status()).into());
    }
    println!("     ✅ Rejected text/plain");
    Ok(())
}

async fn test_link_round_trip(client: &reqwest::Client, base_url: &str, session: &str) -> Result<(), Box<dyn Error>> {
    println!("\n🌐 TEST: Upload, share and view");
    println!("{}", "-".repeat(80));

    let test_file = "test-data/panorama.jpg";
    let data = if Path::new(test_file).exists() {
        println!("     📂 Loading: {}", test_file);
        std::fs::read(test_file)?
    } else {
        println!("     📝 Generating test data");
        generated_png()
    };

    let upload_response = client
        .post(format!("{}/api/upload", base_url))
        .bearer_auth(session)
        .multipart(image_form(data.clone())?)
        .send()
        .await?;

    if !upload_response.status().is_success() {
        let error_text = upload_response.text().await?;
        return Err(format!("❌ Upload failed: {}", error_text).into());
    }

    let upload_data: serde_json::Value = upload_response.json().await?;
    let link = upload_data["link"].as_str().ok_or("Missing link in response")?;
    let token = upload_data["token"].as_str().ok_or("Missing token in response")?;
    println!("     ✅ Link: {}", link);
    println!("     ✅ Stages: {}", upload_data["stages"]);

    if !link.ends_with(&format!("/view/{}", token)) {
        return Err(format!("❌ Link does not end with its token: {}", link).into());
    }

    // Resolve through the API
    let resolve_response = client
        .get(format!("{}/api/links/{}", base_url, token))
        .send()
        .await?;
    if !resolve_response.status().is_success() {
        return Err(format!("❌ Resolve failed: {}", resolve_response.status()).into());
    }
    let resolved: serde_json::Value = resolve_response.json().await?;
    let viewer_url = resolved["viewer_url"].as_str().ok_or("Missing viewer_url")?;
    let (_, object_path) = viewer_url.split_once("/3d/").ok_or("viewer_url is not under /3d/")?;
    println!("     ✅ Viewer URL: {}", viewer_url);

    // The share page embeds the viewer
    let page = client
        .get(format!("{}/view/{}", base_url, token))
        .send()
        .await?;
    if !page.status().is_success() {
        return Err(format!("❌ View page failed: {}", page.status()).into());
    }
    let html = page.text().await?;
    if !html.contains(object_path) {
        return Err("❌ View page does not reference the panorama".into());
    }
    println!("     ✅ View page renders");

    // The panorama comes back byte for byte through the proxy
    let image = client
        .get(format!("{}/3d/{}", base_url, object_path))
        .send()
        .await?;
    if !image.status().is_success() {
        return Err(format!("❌ Proxy fetch failed: {}", image.status()).into());
    }
    let fetched = image.bytes().await?;
    if fetched.as_ref() != data.as_slice() {
        return Err("❌ Proxied bytes differ from upload".into());
    }
    println!("     ✅ Proxied {} bytes", fetched.len());

    Ok(())
}

async fn test_garbled_token(client: &reqwest::Client, base_url: &str) -> Result<(), Box<dyn Error>> {
    println!("\n🧩 TEST: Garbled token");
    println!("{}", "-".repeat(80));

    let response = client
        .get(format!("{}/api/links/not-a-token", base_url))
        .send()
        .await?;

    if response.status() != reqwest::StatusCode::BAD_REQUEST {
        return Err(format!("❌ Expected 400, got {}", response.status()).into());
    }
    let body: serde_json::Value = response.json().await?;
    if body["retryable"] != json!(true) {
        return Err(format!("❌ Decode errors should be retryable: {}", body).into());
    }
    println!("     ✅ {}", body["error"]);
    Ok(())
}

async fn sign_out(client: &reqwest::Client, base_url: &str, session: &str) -> Result<(), Box<dyn Error>> {
    println!("\n👋 TEST: Sign out");
    println!("{}", "-".repeat(80));

    let response = client
        .post(format!("{}/api/auth/sign-out", base_url))
        .bearer_auth(session)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(format!("❌ Sign-out failed: {}", response.status()).into());
    }

    let me = client
        .get(format!("{}/api/auth/me", base_url))
        .bearer_auth(session)
        .send()
        .await?;
    if me.status() != reqwest::StatusCode::UNAUTHORIZED {
        return Err(format!("❌ Session still active: {}", me.status()).into());
    }
    println!("     ✅ Session closed");
    Ok(())
}

fn image_form(data: Vec<u8>) -> Result<multipart::Form, Box<dyn Error>> {
    Ok(multipart::Form::new()
        .part("file", multipart::Part::bytes(data)
            .file_name("smoke-panorama.png")
            .mime_str("image/png")?))
}

/// Smallest valid PNG: a single transparent pixel
fn generated_png() -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
        0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
        0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
        0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
    ]
}
