// Copyright 2025 HMUX Connector Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::*;

#[test]
fn test_validate_backend_addr() {
    assert!(validate_backend_addr("127.0.0.1:6802").is_ok());
    assert!(validate_backend_addr("app1.internal:6800").is_ok());
    assert!(validate_backend_addr("[::1]:6802").is_ok());
}

#[test]
fn test_validate_backend_addr_rejects_bad_input() {
    assert!(validate_backend_addr("127.0.0.1").is_err());
    assert!(validate_backend_addr(":6802").is_err());
    assert!(validate_backend_addr("host:0").is_err());
    assert!(validate_backend_addr("host:http").is_err());
    assert!(validate_backend_addr("host:70000").is_err());
}

#[test]
fn test_parse_header() {
    assert_eq!(
        parse_header("Content-Type: text/html").unwrap(),
        ("Content-Type".to_string(), "text/html".to_string())
    );
    assert_eq!(
        parse_header("X-Empty:").unwrap(),
        ("X-Empty".to_string(), String::new())
    );
    // Only the first colon separates name and value.
    assert_eq!(
        parse_header("Referer: http://example.com/").unwrap().1,
        "http://example.com/"
    );
}

#[test]
fn test_parse_header_rejects_bad_input() {
    assert!(parse_header("no colon").is_err());
    assert!(parse_header(": value").is_err());
    assert!(parse_header("Bad Name: value").is_err());
}

#[test]
fn test_policy_from_name() {
    assert_eq!(policy_from_name("single").unwrap().name(), "single");
    assert_eq!(policy_from_name("round-robin").unwrap().name(), "round-robin");
    assert_eq!(policy_from_name("hash").unwrap().name(), "hash");
    assert_eq!(policy_from_name("session").unwrap().name(), "session");
    assert!(policy_from_name("random").is_err());
}

#[test]
fn test_build_request_splits_query() {
    let request = build_request("get", "/search?q=rust&page=2", &[], None);
    assert_eq!(request.method, "GET");
    assert_eq!(request.uri, "/search");
    assert_eq!(request.query_string.as_deref(), Some("q=rust&page=2"));
    assert_eq!(request.protocol.as_deref(), Some("HTTP/1.1"));
    assert_eq!(request.content_length, None);
}

#[test]
fn test_build_request_with_body_and_headers() {
    let headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("X-Trace".to_string(), "1".to_string()),
    ];
    let request = build_request("POST", "/orders", &headers, Some("{\"n\":1}"));
    assert_eq!(request.content_length, Some(7));
    assert_eq!(request.content_type.as_deref(), Some("application/json"));
    assert_eq!(request.headers, headers);
}

#[test]
fn test_render_head() {
    let response = Response::new("404 Not Found").with_header("Content-Type", "text/plain");
    assert_eq!(render_head(&response), "404 Not Found\nContent-Type: text/plain\n\n");
}

#[test]
fn test_echo_response() {
    let request = RequestAttributes::new("PUT", "/doc")
        .with_query_string("v=2")
        .with_header("Accept", "*/*");
    let response = echo_response(&request, &Bytes::from_static(b"payload"));

    assert_eq!(response.status_code(), Some(200));
    assert_eq!(response.header("X-Echo-Length"), Some("7"));
    assert_eq!(&response.body[..], b"PUT /doc?v=2\nAccept: */*\n\npayload");
}

#[test]
fn test_routing_hint_prefers_explicit_hint() {
    let request = build_request("GET", "/cart;jsessionid=bAbc", &[], None);
    assert_eq!(routing_hint(Some("cOverride"), &request), Some("cOverride"));
    assert_eq!(routing_hint(None, &request), Some("bAbc"));
}

#[test]
fn test_routing_hint_from_cookie() {
    let headers = vec![("Cookie".to_string(), "JSESSIONID=aXyz; other=1".to_string())];
    let request = build_request("GET", "/", &headers, None);
    assert_eq!(routing_hint(None, &request), Some("aXyz"));
    assert_eq!(routing_hint(None, &build_request("GET", "/", &[], None)), None);
}
