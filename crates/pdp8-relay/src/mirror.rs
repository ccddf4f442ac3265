use std::collections::BTreeMap;

use pdp8_core::protocol::Event;

/// Last known state of the console and of every device, kept so a newly
/// connected observer can be brought up to date in one burst.
#[derive(Default)]
pub struct StateMirror {
    console: Option<Event>,
    devices: BTreeMap<(String, &'static str), Event>,
}

impl StateMirror {
    pub fn record(&mut self, event: &Event) {
        if !event.is_state() {
            return;
        }
        match event.device() {
            None => self.console = Some(event.clone()),
            Some(device) => {
                self.devices
                    .insert((device.to_string(), event.tag()), event.clone());
            }
        }
    }

    /// Console first, then devices by name.
    pub fn snapshot(&self) -> Vec<Event> {
        self.console
            .iter()
            .chain(self.devices.values())
            .cloned()
            .collect()
    }
}
