use serde_json::{Value, json};

use super::{ToolError, ToolFuture, ToolInfo, ToolTrait, required_str};

const CONDITIONS: [&str; 4] = ["sunny", "cloudy", "rainy", "windy"];

/// Offline weather report derived from the location name.
pub struct WeatherTool;

impl WeatherTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeatherTool {
    fn default() -> Self {
        Self::new()
    }
}

fn report(location: &str) -> Value {
    let seed: u32 = location
        .to_lowercase()
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    let conditions = CONDITIONS[(seed % CONDITIONS.len() as u32) as usize];
    let temperature_c = (seed % 30) as i64 - 2;

    json!({
        "location": location,
        "conditions": conditions,
        "temperature_c": temperature_c,
        "summary": format!("It is {conditions} and {temperature_c}°C in {location}."),
    })
}

impl ToolTrait for WeatherTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "get_weather_for_location".to_string(),
            description: "Get the current weather for a city or place".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "location": {
                        "type": "string",
                        "description": "City or place name"
                    }
                },
                "required": ["location"]
            }),
        }
    }

    fn execute(&self, arguments: Value) -> ToolFuture {
        Box::pin(async move {
            let location = required_str(&arguments, "location")?.trim();
            if location.is_empty() {
                return Err(ToolError::InvalidArguments("Location is empty".to_string()));
            }
            Ok(report(location))
        })
    }
}
