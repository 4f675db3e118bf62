use anyhow::{anyhow, Context};
use regex::Regex;
use reqwest::{StatusCode, Url};

use crate::sigv4::{percent_encode, RequestSigner};

/// Minimal S3-compatible client: `list-type=2` prefix listing (optionally
/// delimited) and per-key delete, all SigV4-signed. Only what the storage
/// reconciler needs.
#[derive(Clone)]
pub struct ObjectStorageClient {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    signer: RequestSigner,
    common_prefix_re: Regex,
    key_re: Regex,
    continuation_re: Regex,
}

#[derive(Debug)]
struct ListingPage {
    prefixes: Vec<String>,
    keys: Vec<String>,
    next_token: Option<String>,
}

impl ObjectStorageClient {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build object storage HTTP client")?;
        let signer = RequestSigner::new(access_key, secret_key, region, "s3")?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            signer,
            common_prefix_re: Regex::new(r"<CommonPrefixes>\s*<Prefix>([^<]*)</Prefix>")
                .context("invalid CommonPrefixes pattern")?,
            key_re: Regex::new(r"<Key>([^<]*)</Key>").context("invalid Key pattern")?,
            continuation_re: Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>")
                .context("invalid NextContinuationToken pattern")?,
        })
    }

    /// Lists the immediate child prefixes under `prefix` (delimiter `/`).
    pub async fn list_prefixes(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(prefix, Some("/"), token.as_deref()).await?;
            prefixes.extend(page.prefixes);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(prefixes)
    }

    /// Lists every object key under `prefix`, following pagination.
    pub async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(prefix, None, token.as_deref()).await?;
            keys.extend(page.keys);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Deletes one object. A 404 counts as success: the key is gone either
    /// way, and the reconciler must tolerate racing deletions.
    pub async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}/{}/{}",
            self.endpoint,
            self.bucket,
            percent_encode(key, false)
        );
        let signed = self.signer.sign("DELETE", &url, b"")?;
        let response = signed
            .apply(self.http.delete(&url))
            .send()
            .await
            .with_context(|| format!("delete of {key} failed"))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!("delete of {key} returned {status}: {body}"))
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> anyhow::Result<ListingPage> {
        let mut url = Url::parse(&format!("{}/{}", self.endpoint, self.bucket))
            .context("invalid object storage endpoint")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("list-type", "2");
            if !prefix.is_empty() {
                query.append_pair("prefix", prefix);
            }
            if let Some(delimiter) = delimiter {
                query.append_pair("delimiter", delimiter);
            }
            if let Some(token) = token {
                query.append_pair("continuation-token", token);
            }
        }

        let url = url.to_string();
        let signed = self.signer.sign("GET", &url, b"")?;
        let response = signed
            .apply(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("listing under {prefix:?} failed"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read listing response body")?;
        if !status.is_success() {
            return Err(anyhow!("listing under {prefix:?} returned {status}: {body}"));
        }

        Ok(self.parse_listing(&body))
    }

    fn parse_listing(&self, body: &str) -> ListingPage {
        let prefixes = self
            .common_prefix_re
            .captures_iter(body)
            .map(|capture| xml_unescape(&capture[1]))
            .collect();
        let keys = self
            .key_re
            .captures_iter(body)
            .map(|capture| xml_unescape(&capture[1]))
            .collect();
        let next_token = if body.contains("<IsTruncated>true</IsTruncated>") {
            self.continuation_re
                .captures(body)
                .map(|capture| xml_unescape(&capture[1]))
        } else {
            None
        };

        ListingPage {
            prefixes,
            keys,
            next_token,
        }
    }
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ObjectStorageClient {
        ObjectStorageClient::new("http://127.0.0.1:9000", "uploads", "us-east-1", "ak", "sk")
            .unwrap()
    }

    const LISTING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>uploads</Name>
  <Prefix>user-1/listings/</Prefix>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>user-1/listings/l1/a.jpg</Key></Contents>
  <Contents><Key>user-1/listings/l1/b &amp; c.jpg</Key></Contents>
  <CommonPrefixes><Prefix>user-1/listings/l1/</Prefix></CommonPrefixes>
  <CommonPrefixes><Prefix>user-1/listings/l2/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

    #[test]
    fn parses_prefixes_without_the_echoed_request_prefix() {
        let page = client().parse_listing(LISTING);
        assert_eq!(
            page.prefixes,
            vec![
                "user-1/listings/l1/".to_string(),
                "user-1/listings/l2/".to_string()
            ]
        );
    }

    #[test]
    fn parses_and_unescapes_keys() {
        let page = client().parse_listing(LISTING);
        assert_eq!(
            page.keys,
            vec![
                "user-1/listings/l1/a.jpg".to_string(),
                "user-1/listings/l1/b & c.jpg".to_string()
            ]
        );
        assert!(page.next_token.is_none());
    }

    #[test]
    fn truncated_listing_exposes_the_continuation_token() {
        let body = r#"<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok-123</NextContinuationToken>
  <Contents><Key>k</Key></Contents>
</ListBucketResult>"#;
        let page = client().parse_listing(body);
        assert_eq!(page.next_token.as_deref(), Some("tok-123"));
    }
}
