use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub fn xml_to_python(xml: &str) -> Result<String, JsValue> {
    crate::xml_to_python(xml).map_err(|e| JsValue::from_str(&e.to_string()))
}

#[wasm_bindgen]
pub fn json_to_python(json: &str) -> Result<String, JsValue> {
    crate::json_to_python(json).map_err(|e| JsValue::from_str(&e.to_string()))
}
