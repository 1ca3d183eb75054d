use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::info;

use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::store::{FieldStore, NewField, NewSchedule, ReservationStore, ScheduleStore, StoreError};

use super::error::{ServiceError, ServiceResult, store_err};
use super::slots::{candidate_slots, slot_length};

/// Owner-supplied attributes of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInput {
    pub name: String,
    pub address: String,
    pub description: String,
    pub image_url: String,
    pub price_per_hour: i64,
}

/// One raw weekly schedule entry, as submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleInput {
    pub day_of_week: i64,
    /// `HH:MM`
    pub open_time: String,
    /// `HH:MM`
    pub close_time: String,
}

pub struct FieldService {
    fields: Arc<dyn FieldStore>,
    schedules: Arc<dyn ScheduleStore>,
    reservations: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
}

fn require_id(id: Id, what: &str) -> ServiceResult<()> {
    if id <= 0 {
        return Err(ServiceError::invalid(format!("{what} must be positive")));
    }
    Ok(())
}

fn require_text(value: &str, what: &str, max_len: usize) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::invalid(format!("{what} is required")));
    }
    if value.len() > max_len {
        return Err(ServiceError::invalid(format!("{what} too long")));
    }
    Ok(())
}

fn validate_field_input(input: &FieldInput) -> ServiceResult<()> {
    require_text(&input.name, "name", MAX_NAME_LEN)?;
    require_text(&input.address, "address", MAX_ADDRESS_LEN)?;
    if input.description.len() > MAX_DESCRIPTION_LEN {
        return Err(ServiceError::invalid("description too long"));
    }
    if input.image_url.len() > MAX_IMAGE_URL_LEN {
        return Err(ServiceError::invalid("image_url too long"));
    }
    if input.price_per_hour <= 0 {
        return Err(ServiceError::invalid("price_per_hour must be positive"));
    }
    Ok(())
}

fn parse_hhmm(value: &str, what: &str) -> ServiceResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| ServiceError::invalid(format!("{what} must be HH:MM, got {value:?}")))
}

/// Validate every entry up front; nothing is written unless all pass.
fn parse_schedule(entries: &[ScheduleInput]) -> ServiceResult<Vec<NewSchedule>> {
    if entries.is_empty() {
        return Err(ServiceError::invalid("at least one schedule entry is required"));
    }
    let mut parsed: Vec<NewSchedule> = Vec::with_capacity(entries.len());
    for entry in entries {
        let day = DayOfWeek::from_index(entry.day_of_week).ok_or_else(|| {
            ServiceError::invalid(format!(
                "day_of_week must be between 0 and 6, got {}",
                entry.day_of_week
            ))
        })?;
        let open = parse_hhmm(&entry.open_time, "open_time")?;
        let close = parse_hhmm(&entry.close_time, "close_time")?;
        if close <= open {
            return Err(ServiceError::invalid(format!(
                "close_time must be after open_time on {day}"
            )));
        }
        if parsed.iter().any(|p| p.day == day) {
            return Err(ServiceError::invalid(format!("duplicate schedule for {day}")));
        }
        parsed.push(NewSchedule { day, open, close });
    }
    Ok(parsed)
}

impl FieldService {
    pub fn new(
        fields: Arc<dyn FieldStore>,
        schedules: Arc<dyn ScheduleStore>,
        reservations: Arc<dyn ReservationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fields,
            schedules,
            reservations,
            clock,
        }
    }

    pub async fn create_field(&self, owner_id: Id, input: FieldInput) -> ServiceResult<Field> {
        require_id(owner_id, "owner_id")?;
        validate_field_input(&input)?;
        let field = self
            .fields
            .insert_field(NewField {
                owner_id,
                name: input.name.trim().to_string(),
                address: input.address.trim().to_string(),
                description: input.description,
                image_url: input.image_url,
                price_per_hour: input.price_per_hour,
                created_at: self.clock.now(),
            })
            .await
            .map_err(store_err("creating field"))?;
        info!(field_id = field.id, owner_id, "field created");
        Ok(field)
    }

    pub async fn get_field(&self, id: Id) -> ServiceResult<Field> {
        require_id(id, "field_id")?;
        self.fields
            .get_field(id)
            .await
            .map_err(store_err("loading field"))
    }

    pub async fn list_fields(&self) -> ServiceResult<Vec<Field>> {
        self.fields
            .list_fields()
            .await
            .map_err(store_err("listing fields"))
    }

    pub async fn list_fields_by_owner(&self, owner_id: Id) -> ServiceResult<Vec<Field>> {
        require_id(owner_id, "owner_id")?;
        self.fields
            .list_fields_by_owner(owner_id)
            .await
            .map_err(store_err("listing fields"))
    }

    /// Load a field and make sure `owner_id` owns it.
    async fn owned_field(&self, field_id: Id, owner_id: Id, action: &str) -> ServiceResult<Field> {
        require_id(owner_id, "owner_id")?;
        let field = self.get_field(field_id).await?;
        if !field.is_owned_by(owner_id) {
            return Err(ServiceError::Unauthorized(format!(
                "only the field owner can {action} it"
            )));
        }
        Ok(field)
    }

    pub async fn update_field(
        &self,
        field_id: Id,
        owner_id: Id,
        input: FieldInput,
    ) -> ServiceResult<Field> {
        validate_field_input(&input)?;
        let current = self.owned_field(field_id, owner_id, "update").await?;
        let field = self
            .fields
            .update_field(Field {
                name: input.name.trim().to_string(),
                address: input.address.trim().to_string(),
                description: input.description,
                image_url: input.image_url,
                price_per_hour: input.price_per_hour,
                ..current
            })
            .await
            .map_err(store_err("updating field"))?;
        info!(field_id, owner_id, "field updated");
        Ok(field)
    }

    pub async fn delete_field(&self, field_id: Id, owner_id: Id) -> ServiceResult<()> {
        self.owned_field(field_id, owner_id, "delete").await?;
        self.fields
            .delete_field(field_id)
            .await
            .map_err(|e| match e {
                StoreError::Referenced(_) => ServiceError::invalid("field has active bookings"),
                other => store_err("deleting field")(other),
            })?;
        info!(field_id, owner_id, "field deleted");
        Ok(())
    }

    /// Replace the field's whole weekly schedule.
    pub async fn setup_schedules(
        &self,
        field_id: Id,
        owner_id: Id,
        entries: Vec<ScheduleInput>,
    ) -> ServiceResult<Vec<WeeklySchedule>> {
        require_id(field_id, "field_id")?;
        let parsed = parse_schedule(&entries)?;
        self.owned_field(field_id, owner_id, "schedule").await?;
        let schedules = self
            .schedules
            .replace_schedules(field_id, parsed)
            .await
            .map_err(store_err("replacing schedules"))?;
        info!(field_id, entries = schedules.len(), "schedule replaced");
        Ok(schedules)
    }

    /// Entries ordered by day of week.
    pub async fn get_schedule(&self, field_id: Id) -> ServiceResult<Vec<WeeklySchedule>> {
        require_id(field_id, "field_id")?;
        self.schedules
            .list_schedules(field_id)
            .await
            .map_err(store_err("loading schedule"))
    }

    /// Hourly slots for `date`, each tagged with whether it is free right
    /// now. Empty when the field is closed that day.
    pub async fn find_available_slots(
        &self,
        field_id: Id,
        date: NaiveDate,
    ) -> ServiceResult<Vec<TimeSlot>> {
        let schedules = self.get_schedule(field_id).await?;
        let day = DayOfWeek::of(date);
        let Some(schedule) = schedules.iter().find(|s| s.day == day) else {
            return Ok(Vec::new());
        };

        let spans = candidate_slots(schedule, date, slot_length())
            .ok_or_else(|| ServiceError::invalid("date out of range"))?;
        let mut slots = Vec::new();
        for span in spans {
            let available = self
                .reservations
                .is_available(field_id, span)
                .await
                .map_err(store_err("checking availability"))?;
            slots.push(TimeSlot { span, available });
        }
        Ok(slots)
    }
}
