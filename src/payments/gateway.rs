// VNPay redirect protocol: request signing and callback verification.
//
// The signature input is the canonical query string: every key and value is
// URL-encoded (space as '+'), entries are sorted by encoded key and joined as
// key=value with '&'. The same canonicalization is used to sign and to verify.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sha2::Sha512;

use crate::config::GatewayConfig;
use crate::payments::GatewayCallback;

type HmacSha512 = Hmac<Sha512>;

pub const SECURE_HASH: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE: &str = "vnp_SecureHashType";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway hash secret is not usable as an HMAC key")]
    Key,

    #[error("Callback carries no secure hash")]
    MissingHash,

    #[error("Checksum mismatch")]
    SignatureMismatch,

    #[error("Missing gateway parameter {0}")]
    MissingField(&'static str),

    #[error("Invalid gateway parameter {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Amount {0} cannot be expressed in minor units")]
    Amount(Decimal),
}

/// Everything needed to build one payment URL
#[derive(Debug, Clone)]
pub struct PaymentUrlRequest {
    pub order_id: String,
    pub amount: Decimal,
    pub order_info: String,
    pub client_ip: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Wire amount: whole currency units times 100, exact
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    let minor = amount * Decimal::ONE_HUNDRED;
    if !minor.fract().is_zero() {
        return Err(GatewayError::Amount(amount));
    }
    minor.to_i64().ok_or(GatewayError::Amount(amount))
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2).normalize()
}

/// Characters the gateway's form encoding leaves literal but `urlencoding` escapes
const UNRESERVED_MARKS: [(&str, &str); 5] = [("%21", "!"), ("%27", "'"), ("%28", "("), ("%29", ")"), ("%2A", "*")];

fn encode(raw: &str) -> String {
    let mut encoded = urlencoding::encode(raw).replace("%20", "+");
    for (escaped, literal) in UNRESERVED_MARKS {
        if encoded.contains(escaped) {
            encoded = encoded.replace(escaped, literal);
        }
    }
    encoded
}

/// Canonical query string over the given parameters
pub fn canonical_query<'a>(params: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut encoded: Vec<(String, String)> = params.into_iter().map(|(k, v)| (encode(k), encode(v))).collect();
    encoded.sort_by(|a, b| a.0.cmp(&b.0));
    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Debug, Clone)]
pub struct GatewayCodec {
    config: GatewayConfig,
}

impl GatewayCodec {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    fn mac(&self) -> Result<HmacSha512, GatewayError> {
        HmacSha512::new_from_slice(self.config.hash_secret.as_bytes()).map_err(|_| GatewayError::Key)
    }

    /// Gateway-local timestamp, yyyyMMddHHmmss
    pub fn format_timestamp(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.config.timezone).format("%Y%m%d%H%M%S").to_string()
    }

    /// Uppercase hex HMAC-SHA512 of a canonical query string
    pub fn sign(&self, canonical: &str) -> Result<String, GatewayError> {
        let mut mac = self.mac()?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode_upper(mac.finalize().into_bytes()))
    }

    /// Parameters of a payment request, before signing
    pub fn request_params(&self, request: &PaymentUrlRequest) -> Result<Vec<(&'static str, String)>, GatewayError> {
        Ok(vec![
            ("vnp_Version", self.config.version.clone()),
            ("vnp_Command", "pay".to_string()),
            ("vnp_TmnCode", self.config.tmn_code.clone()),
            ("vnp_Amount", to_minor_units(request.amount)?.to_string()),
            ("vnp_CurrCode", "VND".to_string()),
            ("vnp_TxnRef", request.order_id.clone()),
            ("vnp_OrderInfo", request.order_info.clone()),
            ("vnp_OrderType", self.config.order_type.clone()),
            ("vnp_Locale", self.config.locale.clone()),
            ("vnp_ReturnUrl", self.config.return_url.clone()),
            ("vnp_IpAddr", request.client_ip.clone()),
            ("vnp_CreateDate", self.format_timestamp(request.created_at)),
            ("vnp_ExpireDate", self.format_timestamp(request.expires_at)),
        ])
    }

    /// Signed redirect URL for a payment request
    pub fn build_payment_url(&self, request: &PaymentUrlRequest) -> Result<String, GatewayError> {
        let params = self.request_params(request)?;
        let query = canonical_query(params.iter().map(|(k, v)| (*k, v.as_str())));
        let hash = self.sign(&query)?;
        Ok(format!("{}?{}&{}={}", self.config.pay_url, query, SECURE_HASH, hash))
    }

    /// Recompute the signature over every vnp_ parameter except the hash fields
    /// and compare it in constant time with the one received
    pub fn verify(&self, params: &HashMap<String, String>) -> Result<(), GatewayError> {
        let received = params.get(SECURE_HASH).ok_or(GatewayError::MissingHash)?;
        let received = hex::decode(received).map_err(|_| GatewayError::SignatureMismatch)?;

        let query = canonical_query(
            params
                .iter()
                .filter(|(k, _)| k.starts_with("vnp_") && *k != SECURE_HASH && *k != SECURE_HASH_TYPE)
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        let mut mac = self.mac()?;
        mac.update(query.as_bytes());
        mac.verify_slice(&received).map_err(|_| GatewayError::SignatureMismatch)
    }

    /// Verify and parse a return redirect or notification
    pub fn parse_callback(&self, params: &HashMap<String, String>) -> Result<GatewayCallback, GatewayError> {
        self.verify(params)?;

        let field = |name: &'static str| {
            params
                .get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let order_id = field("vnp_TxnRef").ok_or(GatewayError::MissingField("vnp_TxnRef"))?;
        let amount_raw = field("vnp_Amount").ok_or(GatewayError::MissingField("vnp_Amount"))?;
        let amount_minor = amount_raw.parse::<i64>().map_err(|e| GatewayError::InvalidField {
            field: "vnp_Amount",
            reason: e.to_string(),
        })?;
        let response_code = field("vnp_ResponseCode").ok_or(GatewayError::MissingField("vnp_ResponseCode"))?;

        Ok(GatewayCallback {
            order_id,
            amount_minor,
            response_code,
            transaction_status: field("vnp_TransactionStatus").unwrap_or_default(),
            transaction_no: field("vnp_TransactionNo"),
            bank_code: field("vnp_BankCode"),
            pay_date: field("vnp_PayDate"),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::FixedOffset;

    pub const TEST_SECRET: &str = "SECRETKEY123";

    pub fn test_config() -> GatewayConfig {
        GatewayConfig {
            tmn_code: "DEMO0001".to_string(),
            hash_secret: TEST_SECRET.to_string(),
            pay_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string(),
            return_url: "http://localhost:8080/api/payments/vnpay/return".to_string(),
            timezone: FixedOffset::east_opt(7 * 3600).unwrap(),
            version: "2.1.0".to_string(),
            locale: "vn".to_string(),
            order_type: "other".to_string(),
        }
    }

    pub fn test_codec() -> GatewayCodec {
        GatewayCodec::new(test_config())
    }

    /// Callback parameters as the gateway would send them, signed with the test secret
    pub fn signed_callback(order_id: &str, amount_minor: i64, response_code: &str, status: &str) -> HashMap<String, String> {
        let mut params: HashMap<String, String> = [
            ("vnp_TmnCode", "DEMO0001".to_string()),
            ("vnp_TxnRef", order_id.to_string()),
            ("vnp_Amount", amount_minor.to_string()),
            ("vnp_ResponseCode", response_code.to_string()),
            ("vnp_TransactionStatus", status.to_string()),
            ("vnp_TransactionNo", "14012345".to_string()),
            ("vnp_BankCode", "NCB".to_string()),
            ("vnp_PayDate", "20240601191000".to_string()),
            ("vnp_OrderInfo", format!("Thanh toan don {}", order_id)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let query = canonical_query(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let hash = test_codec().sign(&query).unwrap();
        params.insert(SECURE_HASH.to_string(), hash);
        params.insert(SECURE_HASH_TYPE.to_string(), "HmacSHA512".to_string());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn request() -> PaymentUrlRequest {
        let created_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        PaymentUrlRequest {
            order_id: "20240601120000123456".to_string(),
            amount: dec!(300000),
            order_info: "Dat coc ban 20240601120000123456".to_string(),
            client_ip: "127.0.0.1".to_string(),
            created_at,
            expires_at: created_at + chrono::Duration::minutes(15),
        }
    }

    #[test]
    fn test_signature_matches_reference_vector() {
        let codec = test_codec();
        let url = codec.build_payment_url(&request()).unwrap();

        let expected_query = "vnp_Amount=30000000&vnp_Command=pay&vnp_CreateDate=20240601190000\
            &vnp_CurrCode=VND&vnp_ExpireDate=20240601191500&vnp_IpAddr=127.0.0.1&vnp_Locale=vn\
            &vnp_OrderInfo=Dat+coc+ban+20240601120000123456&vnp_OrderType=other\
            &vnp_ReturnUrl=http%3A%2F%2Flocalhost%3A8080%2Fapi%2Fpayments%2Fvnpay%2Freturn\
            &vnp_TmnCode=DEMO0001&vnp_TxnRef=20240601120000123456&vnp_Version=2.1.0";
        let expected_hash = "04B79438AC4A9BBB5AD3EC70170A4FE30946FEA1333D78D00C765D5B17FBE10A\
            160F90FDD940400E2B2BA7DD35B65E65C16812F531E3E9B0C93D13B487E10763";

        assert_eq!(
            url,
            format!(
                "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html?{}&vnp_SecureHash={}",
                expected_query, expected_hash
            )
        );
    }

    #[test]
    fn test_timestamps_use_gateway_offset() {
        let codec = test_codec();
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 20, 30, 5).unwrap();
        assert_eq!(codec.format_timestamp(at), "20250101033005");
    }

    #[test]
    fn test_canonical_query_sorts_by_encoded_key() {
        let query = canonical_query(vec![("b", "x y"), ("a", "1&2"), ("A", "z")]);
        assert_eq!(query, "A=z&a=1%262&b=x+y");
    }

    #[test]
    fn test_punctuation_is_signed_literally() {
        let query = canonical_query(vec![
            ("vnp_OrderInfo", "Dat coc (ban 3) - Chi's party!*"),
            ("vnp_Amount", "10000000"),
        ]);
        assert_eq!(query, "vnp_Amount=10000000&vnp_OrderInfo=Dat+coc+(ban+3)+-+Chi's+party!*");
        assert_eq!(
            test_codec().sign(&query).unwrap(),
            "FF7AC51E35474DF56515AB85EFC20B0D44A69AD0137A99F4598A364428138E13\
            342C56F08A44B3F4E4980575F199EE59CDF7B71BCC72681479E630AC2E490973"
        );
    }

    #[test]
    fn test_minor_units_conversion() {
        assert_eq!(to_minor_units(dec!(300000)).unwrap(), 30_000_000);
        assert_eq!(to_minor_units(dec!(1234.56)).unwrap(), 123_456);
        assert!(to_minor_units(dec!(0.001)).is_err());
        assert_eq!(from_minor_units(30_000_000), dec!(300000));
        assert_eq!(from_minor_units(123_456), dec!(1234.56));
    }

    #[test]
    fn test_verify_accepts_gateway_callback() {
        let params = signed_callback("ORDER1", 30_000_000, "00", "00");
        let callback = test_codec().parse_callback(&params).unwrap();
        assert_eq!(callback.order_id, "ORDER1");
        assert_eq!(callback.amount_minor, 30_000_000);
        assert_eq!(callback.transaction_no.as_deref(), Some("14012345"));
    }

    #[test]
    fn test_tampered_amount_is_rejected() {
        let mut params = signed_callback("ORDER1", 30_000_000, "00", "00");
        params.insert("vnp_Amount".to_string(), "3000000".to_string());
        assert!(matches!(
            test_codec().verify(&params),
            Err(GatewayError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_tampered_hash_is_rejected() {
        let mut params = signed_callback("ORDER1", 30_000_000, "00", "00");
        let hash = params.get(SECURE_HASH).cloned().unwrap();
        let flipped = if hash.starts_with('0') { format!("1{}", &hash[1..]) } else { format!("0{}", &hash[1..]) };
        params.insert(SECURE_HASH.to_string(), flipped);
        assert!(test_codec().verify(&params).is_err());
    }

    #[test]
    fn test_missing_hash_is_rejected() {
        let mut params = signed_callback("ORDER1", 100, "00", "00");
        params.remove(SECURE_HASH);
        assert!(matches!(test_codec().verify(&params), Err(GatewayError::MissingHash)));
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let params = signed_callback("ORDER1", 100, "00", "00");
        let other = GatewayCodec::new(GatewayConfig {
            hash_secret: "ANOTHERSECRET".to_string(),
            ..test_config()
        });
        assert!(other.verify(&params).is_err());
    }
}
