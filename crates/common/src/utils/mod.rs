mod encoding;
mod headers;
mod id;
mod time;

pub use encoding::{decode_body, encode_body, encode_response_body};
pub use headers::{header_lines, headers_to_map, map_to_headers, title_case_header_name};
pub use id::{generate_endpoint_token, generate_request_id, generate_session_id, generate_token};
pub use time::{calculate_expiry, current_timestamp_secs};
