//! Blog fixtures shared by the integration tests: authors write posts, posts
//! carry tags.
#![allow(dead_code)]

use sqlentity::prelude::*;
use sqlentity_testkit::RecordingConnection;
use std::any::Any;

#[derive(Debug, Default)]
pub struct Author {
    pub id: Option<i64>,
    pub name: String,
    pub posts: Association,
}

#[derive(Debug, Default)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub author_id: Option<i64>,
    pub author: Association,
    pub tags: Association,
}

#[derive(Debug, Default)]
pub struct Tag {
    pub id: Option<i64>,
    pub label: String,
}

impl Entity for Author {
    fn entity_type(&self) -> &'static str {
        "Author"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(self.id.into()),
            "name" => Some(self.name.clone().into()),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "id" => self.id = value.try_into()?,
            "name" => self.name = value.try_into()?,
            _ => return Err(unknown_field("Author", field)),
        }
        Ok(())
    }

    fn get_association(&self, field: &str) -> Option<Association> {
        (field == "posts").then(|| self.posts.clone())
    }

    fn set_association(&mut self, field: &str, value: Association) -> Result<()> {
        match field {
            "posts" => self.posts = value,
            _ => return Err(unknown_field("Author", field)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Entity for Post {
    fn entity_type(&self) -> &'static str {
        "Post"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::BigInt(self.id)),
            "title" => Some(self.title.clone().into()),
            "author_id" => Some(self.author_id.into()),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "id" => self.id = value.try_into()?,
            "title" => self.title = value.try_into()?,
            "author_id" => self.author_id = value.try_into()?,
            _ => return Err(unknown_field("Post", field)),
        }
        Ok(())
    }

    fn get_association(&self, field: &str) -> Option<Association> {
        match field {
            "author" => Some(self.author.clone()),
            "tags" => Some(self.tags.clone()),
            _ => None,
        }
    }

    fn set_association(&mut self, field: &str, value: Association) -> Result<()> {
        match field {
            "author" => self.author = value,
            "tags" => self.tags = value,
            _ => return Err(unknown_field("Post", field)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Entity for Tag {
    fn entity_type(&self) -> &'static str {
        "Tag"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(self.id.into()),
            "label" => Some(self.label.clone().into()),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "id" => self.id = value.try_into()?,
            "label" => self.label = value.try_into()?,
            _ => return Err(unknown_field("Tag", field)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub const POST_TAGS: JunctionTable = JunctionTable::new("post_tags", "post_id", "tag_id");

pub fn blog_builder() -> EntityManagerBuilder {
    EntityManagerBuilder::new()
        .entity(
            EntityMetadata::new("Author", "authors", || Box::new(Author::default()))
                .id_strategy(IdStrategy::Database)
                .field(FieldMapping::id("id", SqlType::BigInt))
                .field(FieldMapping::new("name", SqlType::Text))
                .association(AssociationMapping::one_to_many("posts", "Post", "author")),
        )
        .entity(
            EntityMetadata::new("Post", "posts", || Box::new(Post::default()))
                .field(FieldMapping::id("id", SqlType::BigInt))
                .field(FieldMapping::new("title", SqlType::Text))
                .field(FieldMapping::new("author_id", SqlType::BigInt).nullable(true))
                .association(AssociationMapping::to_one("author", "Author", "author_id"))
                .association(AssociationMapping::many_to_many("tags", "Tag", POST_TAGS)),
        )
        .entity(
            EntityMetadata::new("Tag", "tags", || Box::new(Tag::default()))
                .field(FieldMapping::id("id", SqlType::BigInt))
                .field(FieldMapping::new("label", SqlType::Text)),
        )
}

pub fn blog(conn: &RecordingConnection) -> EntityManager<RecordingConnection> {
    blog_builder()
        .build(conn.clone())
        .expect("blog metadata is valid")
}

pub fn author(name: &str) -> EntityRef {
    EntityRef::new(Author {
        name: name.to_string(),
        ..Author::default()
    })
}

pub fn post(id: i64, title: &str) -> EntityRef {
    EntityRef::new(Post {
        id,
        title: title.to_string(),
        ..Post::default()
    })
}

pub fn tag(id: Option<i64>, label: &str) -> EntityRef {
    EntityRef::new(Tag {
        id,
        label: label.to_string(),
    })
}

pub fn author_row(id: i64, name: &str) -> Row {
    Row::from_pairs([("id", Value::BigInt(id)), ("name", Value::from(name))])
}

pub fn post_row(id: i64, title: &str, author_id: Option<i64>) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("title", Value::from(title)),
        ("author_id", Value::from(author_id)),
    ])
}

pub fn tag_row(id: i64, label: &str) -> Row {
    Row::from_pairs([("id", Value::BigInt(id)), ("label", Value::from(label))])
}
