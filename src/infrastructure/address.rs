use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("wire address must carry 6 or 7 segments, found {0}")]
    SegmentCount(usize),
    #[error("street '{0}' does not end in a house number")]
    StreetFormat(String),
}

/// Structured postal address, exchanged on the wire as the delimited string
/// `country;state;postalCode;city;street;houseNumber;busCode;`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub country: String,
    pub state: String,
    pub postal_code: String,
    pub city: String,
    pub street: String,
    pub house_number: String,
    pub bus_code: Option<String>,
}

impl Address {
    /// Parses the wire form. The trailing delimiter is tolerated either way.
    pub fn from_wire(wire: &str) -> Result<Self, AddressError> {
        let trimmed = wire.strip_suffix(';').unwrap_or(wire);
        let parts: Vec<&str> = trimmed.split(';').collect();
        if parts.len() != 7 && parts.len() != 6 {
            return Err(AddressError::SegmentCount(parts.len()));
        }
        Ok(Self {
            country: parts[0].to_string(),
            state: parts[1].to_string(),
            postal_code: parts[2].to_string(),
            city: parts[3].to_string(),
            street: parts[4].to_string(),
            house_number: parts[5].to_string(),
            bus_code: parts
                .get(6)
                .filter(|code| !code.is_empty())
                .map(|code| code.to_string()),
        })
    }

    pub fn to_wire(&self) -> String {
        format!(
            "{};{};{};{};{};{};{};",
            self.country,
            self.state,
            self.postal_code,
            self.city,
            self.street,
            self.house_number,
            self.bus_code.as_deref().unwrap_or("")
        )
    }

    /// Splits a combined street line ("Main Street 123 A") into street name,
    /// house number and optional bus code.
    pub fn parse_street(line: &str) -> Result<(String, String, Option<String>), AddressError> {
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        let bus_code = match tokens.last() {
            Some(last) if last.chars().all(|c| c.is_ascii_alphabetic()) && tokens.len() > 2 => {
                tokens.pop().map(|code| code.to_string())
            }
            _ => None,
        };
        let number = match tokens.last() {
            Some(last) if last.chars().all(|c| c.is_ascii_digit()) => {
                tokens.pop().map(|n| n.to_string())
            }
            _ => None,
        };
        let number = number.ok_or_else(|| AddressError::StreetFormat(line.to_string()))?;
        if tokens.is_empty() {
            return Err(AddressError::StreetFormat(line.to_string()));
        }
        Ok((tokens.join(" "), number, bus_code))
    }
}

/// Renders a CRM address object (`{Street, City, State, PostalCode,
/// Country}`) into the wire form. Street parse failures and absent objects
/// render as an empty string rather than failing the surrounding action;
/// addresses are advisory data on the documents that carry them.
pub fn format_crm_address(address: Option<&Value>) -> String {
    let Some(Value::Object(fields)) = address else {
        return String::new();
    };
    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let street_line = text("Street");
    if street_line.is_empty() {
        return String::new();
    }
    match Address::parse_street(&street_line) {
        Ok((street, house_number, bus_code)) => Address {
            country: text("Country"),
            state: text("State"),
            postal_code: text("PostalCode"),
            city: text("City"),
            street,
            house_number,
            bus_code,
        }
        .to_wire(),
        Err(e) => {
            tracing::warn!(error = %e, "address dropped from payload");
            String::new()
        }
    }
}
